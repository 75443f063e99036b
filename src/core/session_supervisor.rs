//! 会话监管：取消与回合期限
//!
//! 持有根 CancellationToken（进程关闭时取消）；每个回合派生子 token，并附带整体期限，
//! 卡住的模型后端或内核不会让某个 peer 无限等待。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    turn_timeout: Duration,
}

impl SessionSupervisor {
    pub fn new(turn_timeout: Duration) -> Self {
        Self::with_token(CancellationToken::new(), turn_timeout)
    }

    /// 挂在外部 token（如关闭管理器）之下
    pub fn with_token(parent: CancellationToken, turn_timeout: Duration) -> Self {
        Self {
            cancel_token: parent.child_token(),
            turn_timeout,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 取消所有进行中的回合
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 创建子 token（用于单个回合）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }

    /// 在取消与期限约束下运行一个回合
    pub async fn run_turn<F, T>(&self, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        let token = self.child_token();
        tokio::select! {
            _ = token.cancelled() => Err(AgentError::Cancelled),
            res = tokio::time::timeout(self.turn_timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(AgentError::DeadlineExceeded(self.turn_timeout)),
            },
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_turn_ok() {
        let supervisor = SessionSupervisor::default();
        let out = supervisor.run_turn(async { Ok::<_, AgentError>(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_run_turn_deadline() {
        let supervisor = SessionSupervisor::new(Duration::from_millis(50));
        let err = supervisor
            .run_turn(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, AgentError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn test_parent_cancel_propagates() {
        let parent = CancellationToken::new();
        let supervisor = SessionSupervisor::with_token(parent.clone(), Duration::from_secs(5));
        parent.cancel();
        assert!(supervisor.is_cancelled());
        let err = supervisor
            .run_turn(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, AgentError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
