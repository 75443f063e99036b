//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发关闭令牌：进行中的回合随之取消（回合令牌是它的子令牌），
//! 前端循环退出后依次执行清理任务，最后关闭代码内核进程。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::kernel::KernelSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupted,
    /// SIGTERM
    Terminated,
    /// 输入结束
    InputClosed,
}

/// 进程级关闭信号
#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根令牌；回合监管器从它派生子令牌
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                tracing::info!(reason = ?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupted);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminated);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            task_timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub async fn run_cleanup(&self) {
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!(task = name, "cleanup done"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(
                    task = name,
                    secs = self.task_timeout.as_secs(),
                    "cleanup timed out"
                ),
            }
        }
    }
}

/// 关闭代码内核会话并终止子进程
pub struct KernelCleanup {
    session: Arc<KernelSession>,
}

impl KernelCleanup {
    pub fn new(session: Arc<KernelSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ShutdownCleanup for KernelCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.session.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}

/// 运行前端直到其自行结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<App, Fut>(
    manager: Arc<ShutdownManager>,
    app: App,
    cleanup: impl FnOnce() -> Fut,
) where
    App: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => manager.shutdown(ShutdownReason::InputClosed),
        _ = manager.token.cancelled() => {}
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::kernel::MockKernel;

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::Terminated);
        manager.shutdown(ShutdownReason::Interrupted);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminated));
    }

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl ShutdownCleanup for Counting {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Stuck;

    #[async_trait]
    impl ShutdownCleanup for Stuck {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[tokio::test]
    async fn test_stuck_task_does_not_block_later_ones() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        coordinator.register(Stuck);
        coordinator.register(Counting(calls.clone()));
        coordinator.run_cleanup().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kernel_cleanup_closes_session() {
        let session = Arc::new(KernelSession::new(
            Arc::new(MockKernel::new()),
            Duration::from_millis(100),
        ));
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register(KernelCleanup::new(session.clone()));
        coordinator.run_cleanup().await;
        assert!(!session.is_alive().await);
    }

    #[tokio::test]
    async fn test_app_completion_records_input_closed() {
        let manager = Arc::new(ShutdownManager::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        run_with_graceful_shutdown(manager.clone(), async {}, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(manager.reason(), Some(ShutdownReason::InputClosed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
