//! 内核传输层抽象：按通道收发 KernelMessage
//!
//! 会话层只依赖此 trait；真实实现为 ProcessKernel（子进程 stdio），测试使用 MockKernel。

use std::time::Duration;

use async_trait::async_trait;

use crate::core::KernelError;
use crate::kernel::protocol::{Channel, KernelMessage};

#[async_trait]
pub trait KernelTransport: Send + Sync {
    /// 发送一条请求（shell 或 control）
    async fn send(&self, msg: KernelMessage) -> Result<(), KernelError>;

    /// 在 `timeout` 内从指定通道取下一条消息
    ///
    /// `Ok(None)` 表示本次轮询超时；进程退出或管道断开返回 `Err(KernelError::Crashed)`。
    async fn recv(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<KernelMessage>, KernelError>;

    async fn is_alive(&self) -> bool;

    /// 中断当前执行（不等待结果）
    async fn interrupt(&self) -> Result<(), KernelError>;

    /// 重启：丢弃解释器状态，重新执行初始化文件
    async fn restart(&self) -> Result<(), KernelError>;

    async fn shutdown(&self) -> Result<(), KernelError>;
}
