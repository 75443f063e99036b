//! OpenAI 兼容 API 客户端（纯文本）
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url），用于聊天模式与代码模式。
//! 不提交函数元数据：工具结果以 user 消息 `[name] content` 的形式进入上下文。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::traits::{LlmError, ModelBackend, ModelReply};
use crate::memory::{Message, Role};
use crate::tools::ToolSpec;

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, temperature: f32) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature,
            usage: TokenUsage::new(),
        }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }
}

fn build_error(e: OpenAIError) -> LlmError {
    LlmError::Backend(format!("failed to build request: {e}"))
}

/// Message → API 消息；Tool 结果改写为 user 消息，函数调用改写为 assistant 文本
pub fn to_openai_messages(
    messages: &[Message],
) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    messages
        .iter()
        .map(|m| {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_error)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(build_error)?,
                ),
                Role::Tool => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(format!(
                            "[{}] {}",
                            m.name.as_deref().unwrap_or("tool"),
                            m.content
                        ))
                        .build()
                        .map_err(build_error)?,
                ),
                Role::Assistant => {
                    let content = match &m.function_call {
                        Some(call) if m.content.is_empty() => {
                            format!("{}({})", call.name, call.arguments)
                        }
                        _ => m.content.clone(),
                    };
                    ChatCompletionRequestMessage::Assistant(
                        ChatCompletionRequestAssistantMessageArgs::default()
                            .content(content)
                            .build()
                            .map_err(build_error)?,
                    )
                }
            };
            Ok(msg)
        })
        .collect()
}

fn map_api_error(e: OpenAIError) -> LlmError {
    match e {
        OpenAIError::Reqwest(inner) => LlmError::Connection(inner.to_string()),
        other => {
            let text = other.to_string();
            let lower = text.to_lowercase();
            if lower.contains("api key") || lower.contains("unauthorized") {
                LlmError::Auth(text)
            } else {
                LlmError::Backend(text)
            }
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ModelReply, LlmError> {
        if tools.is_some_and(|t| !t.is_empty()) {
            tracing::warn!(model = %self.model, "openai backend ignores function metadata");
        }
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .temperature(self.temperature)
            .messages(to_openai_messages(messages)?)
            .build()
            .map_err(build_error)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(map_api_error)?;

        if let Some(usage) = &response.usage {
            self.usage.add(
                usage.prompt_tokens as u64,
                usage.completion_tokens as u64,
            );
            let (_, _, total) = self.usage.get();
            tracing::debug!(total_tokens = total, "openai usage");
        }

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        Ok(ModelReply::Text(content))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FunctionCall;

    #[test]
    fn test_tool_messages_become_user_messages() {
        let messages = vec![
            Message::system("sys"),
            Message::user("画图"),
            Message::assistant_call(
                "",
                FunctionCall {
                    name: "get_time".to_string(),
                    arguments: "{}".to_string(),
                },
            ),
            Message::tool("get_time", "12:00"),
        ];
        let converted = to_openai_messages(&messages).unwrap();
        assert_eq!(converted.len(), 4);
        assert!(matches!(converted[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(converted[2], ChatCompletionRequestMessage::Assistant(_)));
        assert!(matches!(converted[3], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }
}
