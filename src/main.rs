//! wxbot - 控制台前端
//!
//! 每行标准输入是一条消息；`@peer 内容` 指定发送者，否则记为 `console`。
//! 每条消息在独立任务中处理，回复经 MessageSender 打印。
//!
//! 用法：`wxbot [config.toml]`，环境变量 `WXBOT__*` 覆盖配置，`RUST_LOG` 控制日志级别。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::FutureExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;

use wxbot::config::{load_config, AppConfig};
use wxbot::core::{
    run_with_graceful_shutdown, KernelCleanup, ShutdownCoordinator, ShutdownManager,
};
use wxbot::delivery::{ConsoleSender, MessageSender};
use wxbot::{Orchestrator, OrchestratorBuilder};

const DEFAULT_PEER: &str = "console";

/// 拆出 `@peer 内容`；没有前缀时 peer 为 console
fn parse_line(line: &str) -> (String, String) {
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((peer, text)) = rest.split_once(char::is_whitespace) {
            let text = text.trim();
            if !peer.is_empty() && !text.is_empty() {
                return (peer.to_string(), text.to_string());
            }
        }
    }
    (DEFAULT_PEER.to_string(), line.to_string())
}

async fn read_loop(orchestrator: Arc<Orchestrator>, sender: Arc<dyn MessageSender>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turns = JoinSet::new();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (peer, text) = parse_line(line);
        let orchestrator = orchestrator.clone();
        let sender = sender.clone();
        turns.spawn(async move {
            let reply = orchestrator.handle(&peer, &text).await;
            sender.send_text(&peer, &reply, None).await;
        });
        while let Some(Some(res)) = turns.join_next().now_or_never() {
            if let Err(e) = res {
                tracing::error!(error = %e, "turn task failed");
            }
        }
    }
    tracing::info!(pending = turns.len(), "stdin closed, waiting for pending turns");
    while let Some(res) = turns.join_next().await {
        if let Err(e) = res {
            tracing::error!(error = %e, "turn task failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wxbot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    std::fs::create_dir_all(cfg.app.file_dir())
        .with_context(|| format!("Failed to create {}", cfg.app.file_dir().display()))?;

    let shutdown = Arc::new(ShutdownManager::new());
    let sender: Arc<dyn MessageSender> = Arc::new(ConsoleSender);
    let orchestrator = OrchestratorBuilder::new(cfg)
        .with_sender(sender.clone())
        .with_cancel_token(shutdown.token())
        .build()
        .await
        .context("Failed to build orchestrator")?;
    let orchestrator = Arc::new(orchestrator);
    tracing::info!(backend = %orchestrator.backend_name(), "wxbot ready, type #帮助 for commands");

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.register(KernelCleanup::new(orchestrator.kernel().clone()));

    run_with_graceful_shutdown(
        shutdown,
        read_loop(orchestrator, sender),
        move || async move { coordinator.run_cleanup().await },
    )
    .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("@alice 你好"),
            ("alice".to_string(), "你好".to_string())
        );
        assert_eq!(
            parse_line("#1"),
            (DEFAULT_PEER.to_string(), "#1".to_string())
        );
        assert_eq!(
            parse_line("@alice"),
            (DEFAULT_PEER.to_string(), "@alice".to_string())
        );
    }
}
