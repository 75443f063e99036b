//! Mock 模型后端（用于测试与未配置模型时，无需 API）
//!
//! 默认回显最后一条 User 消息；也可以传入处理函数，按会话内容决定回复。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::traits::{LlmError, ModelBackend, ModelReply};
use crate::memory::{Message, Role};
use crate::tools::ToolSpec;

type Handler =
    dyn Fn(&[Message], Option<&[ToolSpec]>) -> Result<ModelReply, LlmError> + Send + Sync;

#[derive(Clone, Default)]
pub struct MockLlmClient {
    handler: Option<Arc<Handler>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以处理函数决定回复（测试中按轮次或会话内容编排回复）
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&[Message], Option<&[ToolSpec]>) -> Result<ModelReply, LlmError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
        }
    }
}

#[async_trait]
impl ModelBackend for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ModelReply, LlmError> {
        if let Some(handler) = &self.handler {
            return handler(messages, tools);
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(ModelReply::Text(format!("Echo from Mock: {last_user}")))
    }

    fn name(&self) -> &str {
        "mock"
    }
}
