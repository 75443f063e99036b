//! 内核会话：在异步的 shell / iopub 消息流之上提供阻塞式 execute
//!
//! 一次执行：发送 execute_request → 轮询 shell 直到拿到本请求的回执 → 轮询 iopub 直到本请求的 idle 标记，
//! 期间保留最后一条输出。每次轮询都带独立超时；轮询超时或执行被中途丢弃（回合期限、取消）时中断内核。
//!
//! 进程内只有一个会话，所有 peer 共享同一个解释器命名空间；exec_lock 保证同一时刻只有一次执行。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::core::KernelError;
use crate::kernel::protocol::{classify_output, Channel, ExecutionState, KernelMessage};
use crate::kernel::transport::KernelTransport;
use crate::tools::ToolCallResult;

type SharedState = Arc<Mutex<ExecutionState>>;

fn store_state(state: &SharedState, value: ExecutionState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

pub struct KernelSession {
    transport: Option<Arc<dyn KernelTransport>>,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    poll_timeout: Duration,
    state: SharedState,
    closed: AtomicBool,
}

/// 执行进行中时持有执行锁；未 disarm 就被丢弃说明调用方放弃了这次执行。
/// 此时后台发送中断，完成后才释放执行锁，下一次执行不会排在失控的代码后面。
struct InFlight {
    transport: Arc<dyn KernelTransport>,
    state: SharedState,
    lock: Option<OwnedMutexGuard<()>>,
}

impl InFlight {
    fn disarm(mut self) {
        self.lock.take();
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        tracing::warn!("kernel execution abandoned, interrupting");
        let transport = self.transport.clone();
        let state = self.state.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    interrupt_and_settle(transport.as_ref(), &state).await;
                    drop(lock);
                });
            }
            Err(_) => tracing::warn!("no runtime to interrupt the kernel"),
        }
    }
}

/// 中断内核；成功后视为空闲
async fn interrupt_and_settle(transport: &dyn KernelTransport, state: &SharedState) {
    match transport.interrupt().await {
        Ok(()) => store_state(state, ExecutionState::Idle),
        Err(e) => tracing::warn!(error = %e, "kernel interrupt failed"),
    }
}

impl KernelSession {
    pub fn new(transport: Arc<dyn KernelTransport>, poll_timeout: Duration) -> Self {
        Self {
            transport: Some(transport),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            poll_timeout,
            state: Arc::new(Mutex::new(ExecutionState::Idle)),
            closed: AtomicBool::new(false),
        }
    }

    /// 没有后端的会话（内核被禁用或启动失败）；所有执行返回 SessionClosed
    pub fn closed() -> Self {
        Self {
            transport: None,
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            poll_timeout: Duration::from_secs(0),
            state: Arc::new(Mutex::new(ExecutionState::Dead)),
            closed: AtomicBool::new(true),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    pub fn state(&self) -> ExecutionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ExecutionState) {
        store_state(&self.state, state);
    }

    fn transport(&self) -> Result<&Arc<dyn KernelTransport>, KernelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KernelError::SessionClosed);
        }
        self.transport.as_ref().ok_or(KernelError::SessionClosed)
    }

    pub async fn is_alive(&self) -> bool {
        match self.transport() {
            Ok(transport) => transport.is_alive().await,
            Err(_) => false,
        }
    }

    /// 执行一段代码并返回最后一条输出
    pub async fn execute(&self, code: &str) -> Result<ToolCallResult, KernelError> {
        let transport = self.transport()?.clone();
        let lock = self.exec_lock.clone().lock_owned().await;
        if !transport.is_alive().await {
            self.set_state(ExecutionState::Dead);
            return Err(KernelError::SessionClosed);
        }

        let started = Instant::now();
        self.set_state(ExecutionState::Busy);
        let in_flight = InFlight {
            transport: transport.clone(),
            state: self.state.clone(),
            lock: Some(lock),
        };
        let result = self.run(transport.as_ref(), code).await;
        match &result {
            Err(KernelError::Crashed(reason)) => {
                tracing::error!(reason = %reason, "kernel crashed during execution");
                self.set_state(ExecutionState::Dead);
            }
            Err(KernelError::Timeout { after }) => {
                tracing::warn!(after_ms = after.as_millis() as u64, "kernel execution timed out");
                interrupt_and_settle(transport.as_ref(), &self.state).await;
            }
            _ => self.set_state(ExecutionState::Idle),
        }
        in_flight.disarm();
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "kernel execute finished"
        );
        result
    }

    async fn run(
        &self,
        transport: &dyn KernelTransport,
        code: &str,
    ) -> Result<ToolCallResult, KernelError> {
        let request = KernelMessage::execute_request(code);
        let request_id = request.msg_id().to_string();
        transport.send(request).await?;

        let ack = loop {
            match transport.recv(Channel::Shell, self.poll_timeout).await? {
                None => {
                    return Err(KernelError::Timeout {
                        after: self.poll_timeout,
                    })
                }
                Some(msg) if msg.is_child_of(&request_id) => break msg,
                Some(msg) => {
                    tracing::debug!(msg_type = %msg.msg_type(), "discarding stale shell message");
                }
            }
        };

        let mut last_output: Option<Value> = None;
        loop {
            match transport.recv(Channel::Iopub, self.poll_timeout).await? {
                None => break,
                Some(msg) if !msg.is_child_of(&request_id) => continue,
                Some(msg) if msg.is_idle() => break,
                Some(msg) if msg.is_output() => last_output = Some(msg.content),
                Some(_) => {}
            }
        }

        if matches!(ack.status(), Some("error") | Some("aborted")) {
            return Err(KernelError::Execution {
                traceback: ack.traceback(),
            });
        }
        match last_output {
            Some(content) => classify_output(&content),
            None => Ok(ToolCallResult::Text(String::new())),
        }
    }

    /// 中断正在进行的执行；不获取执行锁
    pub async fn interrupt(&self) -> Result<(), KernelError> {
        self.transport()?.interrupt().await
    }

    /// 重启后端；等待当前执行结束
    pub async fn restart(&self) -> Result<(), KernelError> {
        let transport = self.transport()?.clone();
        let _guard = self.exec_lock.lock().await;
        transport.restart().await?;
        self.set_state(ExecutionState::Idle);
        Ok(())
    }

    /// 关闭后端；之后所有调用返回 SessionClosed
    pub async fn shutdown(&self) -> Result<(), KernelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(ExecutionState::Dead);
        match &self.transport {
            Some(transport) => transport.shutdown().await,
            None => Ok(()),
        }
    }

    /// kernel_info 往返，作为启动健康检查
    pub async fn kernel_info(&self) -> Result<Value, KernelError> {
        let transport = self.transport()?.clone();
        let _guard = self.exec_lock.lock().await;
        let request = KernelMessage::kernel_info_request();
        let request_id = request.msg_id().to_string();
        transport.send(request).await?;
        loop {
            match transport.recv(Channel::Shell, self.poll_timeout).await? {
                None => {
                    return Err(KernelError::Timeout {
                        after: self.poll_timeout,
                    })
                }
                Some(msg) if msg.is_child_of(&request_id) => return Ok(msg.content),
                Some(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::mock::{MockKernel, MockReply};
    use serde_json::json;

    fn session(kernel: MockKernel) -> (Arc<MockKernel>, KernelSession) {
        let kernel = Arc::new(kernel);
        let session = KernelSession::new(kernel.clone(), Duration::from_millis(200));
        (kernel, session)
    }

    #[tokio::test]
    async fn test_execute_value() {
        let (_, session) = session(MockKernel::new().on("1+1", MockReply::Value("2".into())));
        let out = session.execute("1+1").await.unwrap();
        assert_eq!(out, ToolCallResult::Text("2".into()));
        assert_eq!(session.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_execute_is_repeatable() {
        let (kernel, session) = session(MockKernel::new().on("x", MockReply::Stream("ok\n".into())));
        for _ in 0..3 {
            assert_eq!(
                session.execute("x").await.unwrap(),
                ToolCallResult::Text("ok\n".into())
            );
        }
        assert_eq!(kernel.executions(), 3);
    }

    #[tokio::test]
    async fn test_execute_image() {
        let (_, session) = session(MockKernel::new().on("plot()", MockReply::Image(vec![1, 2, 3])));
        let out = session.execute("plot()").await.unwrap();
        assert_eq!(
            out,
            ToolCallResult::Image {
                data: vec![1, 2, 3],
                filename: None
            }
        );
    }

    #[tokio::test]
    async fn test_stale_iopub_is_ignored() {
        let kernel = MockKernel::new().on("1+1", MockReply::Value("2".into()));
        let old = KernelMessage::execute_request("old");
        kernel.push_iopub(KernelMessage::reply(
            &old,
            Channel::Iopub,
            "stream",
            json!({ "name": "stdout", "text": "stale" }),
        ));
        kernel.push_iopub(KernelMessage::reply(
            &old,
            Channel::Iopub,
            "status",
            json!({ "execution_state": "idle" }),
        ));
        let (_, session) = session(kernel);
        assert_eq!(
            session.execute("1+1").await.unwrap(),
            ToolCallResult::Text("2".into())
        );
    }

    #[tokio::test]
    async fn test_execution_error_carries_traceback() {
        let (_, session) = session(MockKernel::new().on(
            "1/0",
            MockReply::Error(vec![
                "\u{1b}[0;31mTraceback\u{1b}[0m".into(),
                "ZeroDivisionError: division by zero".into(),
            ]),
        ));
        let err = session.execute("1/0").await.unwrap_err();
        assert_eq!(
            err,
            KernelError::Execution {
                traceback: "Traceback\nZeroDivisionError: division by zero".into()
            }
        );
        assert_eq!(session.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_silent_kernel_times_out() {
        let (_, session) = session(MockKernel::new().on("while True: pass", MockReply::Silent));
        let err = session.execute("while True: pass").await.unwrap_err();
        assert_eq!(
            err,
            KernelError::Timeout {
                after: Duration::from_millis(200)
            }
        );
        assert_eq!(err.to_string(), "Timed out after 200ms waiting for the kernel");
    }

    #[tokio::test]
    async fn test_poll_timeout_interrupts_and_settles() {
        let (kernel, session) = session(
            MockKernel::new()
                .on("while True: pass", MockReply::Silent)
                .on("1+1", MockReply::Value("2".into())),
        );
        assert!(session.execute("while True: pass").await.is_err());
        assert_eq!(kernel.interrupts(), 1);
        assert_eq!(session.state(), ExecutionState::Idle);
        assert_eq!(
            session.execute("1+1").await.unwrap(),
            ToolCallResult::Text("2".into())
        );
    }

    #[tokio::test]
    async fn test_abandoned_execute_interrupts_and_releases_lock() {
        let kernel = Arc::new(
            MockKernel::new()
                .on("while True: pass", MockReply::Silent)
                .on("1+1", MockReply::Value("2".into())),
        );
        let session = KernelSession::new(kernel.clone(), Duration::from_secs(5));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            session.execute("while True: pass"),
        )
        .await;
        assert!(abandoned.is_err());

        let next = tokio::time::timeout(Duration::from_secs(1), session.execute("1+1"))
            .await
            .unwrap();
        assert_eq!(next.unwrap(), ToolCallResult::Text("2".into()));
        assert_eq!(kernel.interrupts(), 1);
        assert_eq!(session.state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_most_recent_output_wins() {
        let (_, session) = session(MockKernel::new().on(
            "print('a'); 40 + 2",
            MockReply::Outputs(vec![
                MockReply::Stream("a\n".into()),
                MockReply::Value("42".into()),
            ]),
        ));
        assert_eq!(
            session.execute("print('a'); 40 + 2").await.unwrap(),
            ToolCallResult::Text("42".into())
        );
    }

    #[tokio::test]
    async fn test_output_after_idle_is_ignored() {
        let (_, session) = session(
            MockKernel::new()
                .on(
                    "x",
                    MockReply::AfterIdle {
                        reply: Box::new(MockReply::Value("1".into())),
                        late: "late\n".into(),
                    },
                )
                .on("y", MockReply::Value("2".into())),
        );
        assert_eq!(
            session.execute("x").await.unwrap(),
            ToolCallResult::Text("1".into())
        );
        assert_eq!(
            session.execute("y").await.unwrap(),
            ToolCallResult::Text("2".into())
        );
    }

    #[tokio::test]
    async fn test_crash_then_closed() {
        let (kernel, session) = session(MockKernel::new().on("boom", MockReply::Crash));
        let err = session.execute("boom").await.unwrap_err();
        assert!(matches!(err, KernelError::Crashed(_)));
        assert_eq!(session.state(), ExecutionState::Dead);
        assert!(!session.is_alive().await);
        assert_eq!(session.execute("1").await.unwrap_err(), KernelError::SessionClosed);

        session.restart().await.unwrap();
        assert_eq!(kernel.restarts(), 1);
        assert!(session.is_alive().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let (_, session) = session(MockKernel::new());
        session.shutdown().await.unwrap();
        session.shutdown().await.unwrap();
        assert_eq!(session.execute("1").await.unwrap_err(), KernelError::SessionClosed);
        assert_eq!(session.interrupt().await.unwrap_err(), KernelError::SessionClosed);
        assert!(KernelSession::closed().execute("1").await.is_err());
    }

    #[tokio::test]
    async fn test_kernel_info() {
        let (_, session) = session(MockKernel::new());
        let info = session.kernel_info().await.unwrap();
        assert_eq!(info["implementation"], "mock");
    }
}
