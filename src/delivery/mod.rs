//! 消息投递：发送文本 / 图片给 peer，以及图片落盘
//!
//! 真实的消息通道（微信等）是外部协作方，只需实现 MessageSender；
//! 发送失败由实现方记录日志，核心不重试。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// 发送端：发后即忘
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// `at` 为群聊中需要 @ 的成员
    async fn send_text(&self, peer: &str, text: &str, at: Option<&str>);

    async fn send_image(&self, peer: &str, path: &Path);
}

/// 图片存储：把字节写为文件并返回路径
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn save(&self, data: &[u8], filename: Option<&str>) -> std::io::Result<PathBuf>;
}

/// 随机 8 位文件名（小写字母与数字）加 `.png`
pub fn random_png_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}.png", &id[..8])
}

/// 保存到固定目录
#[derive(Debug, Clone)]
pub struct FileImageStore {
    dir: PathBuf,
}

impl FileImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// 已存在同名文件时附加随机后缀：`bird.png` → `bird_1a2b3c4d.png`
fn with_random_suffix(name: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{stem}_{}.{}", &id[..8], ext.to_string_lossy()),
        None => format!("{stem}_{}", &id[..8]),
    }
}

#[async_trait]
impl ImageStore for FileImageStore {
    /// 以 create_new 写入，从不覆盖已有文件
    async fn save(&self, data: &[u8], filename: Option<&str>) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let requested = filename
            .and_then(|f| Path::new(f).file_name())
            .map(|f| f.to_string_lossy().into_owned());
        let mut name = requested.clone().unwrap_or_else(random_png_name);
        for _ in 0..8 {
            let path = self.dir.join(&name);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(data).await?;
                    file.flush().await?;
                    tracing::debug!(path = %path.display(), bytes = data.len(), "image saved");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    name = match &requested {
                        Some(requested) => with_random_suffix(requested),
                        None => random_png_name(),
                    };
                }
                Err(e) => return Err(e),
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("no free image name in {}", self.dir.display()),
        ))
    }
}

/// 控制台发送端：打印到 stdout
#[derive(Debug, Default)]
pub struct ConsoleSender;

#[async_trait]
impl MessageSender for ConsoleSender {
    async fn send_text(&self, peer: &str, text: &str, at: Option<&str>) {
        tracing::debug!(peer = %peer, chars = text.chars().count(), "send text");
        match at {
            Some(at) => println!("[{peer}] @{at} {text}"),
            None => println!("[{peer}] {text}"),
        }
    }

    async fn send_image(&self, peer: &str, path: &Path) {
        tracing::debug!(peer = %peer, path = %path.display(), "send image");
        println!("[{peer}] <image {}>", path.display());
    }
}

/// 记录发送内容的发送端（测试用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Text { peer: String, text: String },
    Image { peer: String, path: PathBuf },
}

#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn texts(&self, peer: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Text { peer: p, text } if p == peer => Some(text),
                _ => None,
            })
            .collect()
    }

    fn push(&self, item: Sent) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(item);
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send_text(&self, peer: &str, text: &str, _at: Option<&str>) {
        self.push(Sent::Text {
            peer: peer.to_string(),
            text: text.to_string(),
        });
    }

    async fn send_image(&self, peer: &str, path: &Path) {
        self.push(Sent::Image {
            peer: peer.to_string(),
            path: path.to_path_buf(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_png_name() {
        let name = random_png_name();
        assert_eq!(name.len(), 12);
        assert!(name.ends_with(".png"));
        assert!(name[..8].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[tokio::test]
    async fn test_file_image_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path().join("images"));
        let path = store.save(&[1, 2, 3], None).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);

        let named = store.save(&[4], Some("../escape.png")).await.unwrap();
        assert_eq!(named, dir.path().join("images").join("escape.png"));
    }

    #[tokio::test]
    async fn test_existing_file_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileImageStore::new(dir.path());
        let first = store.save(&[1], Some("bird.png")).await.unwrap();
        let second = store.save(&[2], Some("bird.png")).await.unwrap();
        assert_eq!(first, dir.path().join("bird.png"));
        assert_ne!(first, second);
        assert_eq!(std::fs::read(&first).unwrap(), vec![1]);
        assert_eq!(std::fs::read(&second).unwrap(), vec![2]);

        let name = second.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("bird_") && name.ends_with(".png"), "{name}");
        assert_eq!(name.len(), "bird_".len() + 8 + ".png".len());
    }

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingSender::new();
        sender.send_text("a", "hi", None).await;
        sender.send_text("b", "yo", None).await;
        sender.send_image("a", Path::new("/tmp/x.png")).await;
        assert_eq!(sender.texts("a"), vec!["hi".to_string()]);
        assert_eq!(sender.sent().len(), 3);
    }
}
