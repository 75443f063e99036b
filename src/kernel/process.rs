//! 子进程内核：通过 stdio 以行分隔 JSON 与桥接程序通信
//!
//! 读任务把 stdout 的每一行解析为 KernelMessage，按通道分发到 shell / iopub 两个队列；
//! 队列项带「代」编号，重启后旧进程残留的消息被丢弃。进程退出时两条队列都会收到 Closed。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::core::KernelError;
use crate::kernel::bridge::PYTHON_KERNEL_BRIDGE;
use crate::kernel::protocol::{Channel, KernelMessage};
use crate::kernel::transport::KernelTransport;

/// 发送 shutdown_request 后等待进程自行退出的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// 子进程启动参数
#[derive(Debug, Clone)]
pub struct ProcessKernelConfig {
    /// 解释器命令，可带参数（按空白切分）
    pub command: String,
    /// 启动后执行的初始化脚本
    pub init_file: Option<PathBuf>,
    /// 追加到 PATH 并设为 PYTHONPATH
    pub python_path: Option<String>,
}

impl Default for ProcessKernelConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            init_file: None,
            python_path: None,
        }
    }
}

enum Inbound {
    Message(KernelMessage),
    Closed(String),
}

type Envelope = (u64, Inbound);

pub struct ProcessKernel {
    config: ProcessKernelConfig,
    generation: AtomicU64,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    shell_tx: mpsc::UnboundedSender<Envelope>,
    iopub_tx: mpsc::UnboundedSender<Envelope>,
    shell_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    iopub_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

impl ProcessKernel {
    /// 启动子进程并返回已连接的内核
    pub async fn spawn(config: ProcessKernelConfig) -> Result<Self, KernelError> {
        let (shell_tx, shell_rx) = mpsc::unbounded_channel();
        let (iopub_tx, iopub_rx) = mpsc::unbounded_channel();
        let kernel = Self {
            config,
            generation: AtomicU64::new(0),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            shell_tx,
            iopub_tx,
            shell_rx: Mutex::new(shell_rx),
            iopub_rx: Mutex::new(iopub_rx),
        };
        kernel.start().await?;
        Ok(kernel)
    }

    fn command(&self) -> Result<Command, KernelError> {
        let mut parts = self.config.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| KernelError::Spawn("empty kernel command".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(parts)
            .arg("-u")
            .arg("-c")
            .arg(PYTHON_KERNEL_BRIDGE);
        if let Some(init) = &self.config.init_file {
            cmd.arg(init);
        }
        if let Some(python_path) = &self.config.python_path {
            let path = match std::env::var("PATH") {
                Ok(existing) if !existing.is_empty() => format!("{python_path}:{existing}"),
                _ => python_path.clone(),
            };
            cmd.env("PATH", path).env("PYTHONPATH", python_path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    async fn start(&self) -> Result<(), KernelError> {
        let mut child = self.command()?.spawn().map_err(|e| {
            KernelError::Spawn(format!(
                "failed to spawn kernel `{}`: {e}",
                self.config.command
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::Spawn("failed to capture kernel stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::Spawn("failed to capture kernel stdout".to_string()))?;
        let stderr = child.stderr.take();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let shell_tx = self.shell_tx.clone();
        let iopub_tx = self.iopub_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<KernelMessage>(line) {
                            Ok(msg) => {
                                let tx = match msg.channel {
                                    Channel::Iopub => &iopub_tx,
                                    Channel::Shell | Channel::Control => &shell_tx,
                                };
                                let _ = tx.send((generation, Inbound::Message(msg)));
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, raw = %line, "ignoring non-protocol kernel output");
                            }
                        }
                    }
                    Ok(None) => break "kernel process exited".to_string(),
                    Err(e) => break format!("kernel stdout read failed: {e}"),
                }
            };
            tracing::debug!(generation, reason = %reason, "kernel reader stopped");
            let _ = shell_tx.send((generation, Inbound::Closed(reason.clone())));
            let _ = iopub_tx.send((generation, Inbound::Closed(reason)));
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "kernel", "{}", line);
                }
            });
        }

        tracing::info!(
            pid = child.id().unwrap_or_default(),
            generation,
            command = %self.config.command,
            "kernel process started"
        );
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                }
            }
        }
    }
}

#[async_trait]
impl KernelTransport for ProcessKernel {
    async fn send(&self, msg: KernelMessage) -> Result<(), KernelError> {
        let mut line = serde_json::to_vec(&msg)
            .map_err(|e| KernelError::Protocol(format!("failed to encode request: {e}")))?;
        line.push(b'\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| KernelError::Crashed("kernel stdin is closed".to_string()))?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| KernelError::Crashed(format!("failed to write to kernel: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| KernelError::Crashed(format!("failed to flush kernel stdin: {e}")))?;
        Ok(())
    }

    async fn recv(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<KernelMessage>, KernelError> {
        let mut rx = match channel {
            Channel::Iopub => self.iopub_rx.lock().await,
            Channel::Shell | Channel::Control => self.shell_rx.lock().await,
        };
        let deadline = Instant::now() + timeout;
        loop {
            let envelope = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(KernelError::Crashed("kernel channel closed".to_string())),
                Ok(Some(envelope)) => envelope,
            };
            let (generation, inbound) = envelope;
            if generation != self.generation.load(Ordering::SeqCst) {
                continue;
            }
            return match inbound {
                Inbound::Message(msg) => Ok(Some(msg)),
                Inbound::Closed(reason) => Err(KernelError::Crashed(reason)),
            };
        }
    }

    async fn is_alive(&self) -> bool {
        match self.child.lock().await.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        tracing::info!("interrupting kernel");
        self.send(KernelMessage::interrupt_request()).await
    }

    async fn restart(&self) -> Result<(), KernelError> {
        tracing::info!("restarting kernel");
        let _ = self.send(KernelMessage::shutdown_request(true)).await;
        self.stop().await;
        self.start().await
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        let _ = self.send(KernelMessage::shutdown_request(false)).await;
        self.stop().await;
        tracing::info!("kernel process stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::kernel::{ExecutionState, KernelSession};
    use crate::tools::ToolCallResult;

    fn sh(script: &str) -> ProcessKernelConfig {
        ProcessKernelConfig {
            command: format!("sh {}", script),
            ..Default::default()
        }
    }

    fn write_script(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("kernel.sh");
        std::fs::write(&path, body).unwrap();
        path.display().to_string()
    }

    // 命令行为 `sh script -u -c BRIDGE`，脚本忽略多余参数
    #[tokio::test]
    async fn test_routes_iopub_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            &dir,
            r#"printf '%s\n' '{"channel":"iopub","header":{"msg_id":"a","msg_type":"status"},"content":{"execution_state":"idle"}}'
cat >/dev/null
"#,
        );
        let kernel = ProcessKernel::spawn(sh(&script)).await.unwrap();
        let msg = kernel
            .recv(Channel::Iopub, Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(msg.is_idle());
        assert!(kernel
            .recv(Channel::Shell, Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());
        assert!(kernel.is_alive().await);
        kernel.shutdown().await.unwrap();
        assert!(!kernel.is_alive().await);
    }

    #[tokio::test]
    async fn test_exit_reports_crash() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(&dir, "exit 0\n");
        let kernel = ProcessKernel::spawn(sh(&script)).await.unwrap();
        let err = kernel
            .recv(Channel::Shell, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Crashed(_)));
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    #[tokio::test]
    async fn test_python_bridge_end_to_end() {
        if !python_available() {
            eprintln!("python3 not found, skipping bridge test");
            return;
        }
        let kernel = ProcessKernel::spawn(ProcessKernelConfig::default())
            .await
            .unwrap();
        let session = KernelSession::new(Arc::new(kernel), Duration::from_secs(2));

        let info = session.kernel_info().await.unwrap();
        assert_eq!(info["implementation"], "wxbot-bridge");

        for _ in 0..2 {
            assert_eq!(
                session.execute("1+1").await.unwrap(),
                ToolCallResult::Text("2".into())
            );
        }

        match session.execute("1/0").await.unwrap_err() {
            KernelError::Execution { traceback } => {
                assert!(traceback.contains("ZeroDivisionError"), "{traceback}")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        session.execute("x = 5").await.unwrap();
        let err = session.execute("while True: pass").await.unwrap_err();
        assert!(matches!(err, KernelError::Timeout { .. }));
        assert_eq!(session.state(), ExecutionState::Idle);
        assert_eq!(
            session.execute("x * 2").await.unwrap(),
            ToolCallResult::Text("10".into())
        );

        session.shutdown().await.unwrap();
        assert!(!session.is_alive().await);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = ProcessKernelConfig {
            command: "/nonexistent/wxbot-python".to_string(),
            ..Default::default()
        };
        let err = ProcessKernel::spawn(config).await.err().unwrap();
        assert!(matches!(err, KernelError::Spawn(_)));
    }
}
