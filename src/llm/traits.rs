//! 模型后端抽象
//!
//! 所有后端（ChatGLM 兼容 / OpenAI 兼容 / Mock）实现 ModelBackend：给定完整会话与可选的函数元数据，
//! 返回纯文本或一次结构化函数调用。

use async_trait::async_trait;
use thiserror::Error;

use crate::memory::{FunctionCall, Message};
use crate::tools::ToolSpec;

/// 后端回复：纯文本，或模型要求调用某个工具
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelReply {
    Text(String),
    FunctionCall {
        /// 与函数调用一同返回的文本（常为空）
        content: String,
        call: FunctionCall,
    },
}

/// 后端错误：鉴权、连接、其它
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// 非流式完成；`tools` 为 Some 时把工具描述作为可调用函数提交
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ModelReply, LlmError>;

    /// 后端名称（日志用）
    fn name(&self) -> &str;
}
