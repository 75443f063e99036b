//! ChatGLM 兼容后端（OpenAI 兼容 `/chat/completions`，旧式 functions / function_call）
//!
//! 工具结果以 `role = "function"` + name 提交；assistant 的函数调用原样回传。
//! 只做非流式请求。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::traits::{LlmError, ModelBackend, ModelReply};
use crate::memory::{FunctionCall, Message, Role};
use crate::tools::ToolSpec;

/// 后端连接参数
#[derive(Debug, Clone)]
pub struct ChatGlmOptions {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub proxy: Option<String>,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

pub struct ChatGlmClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

impl ChatGlmClient {
    pub fn new(options: ChatGlmOptions) -> Result<Self, LlmError> {
        let mut builder =
            Client::builder().timeout(Duration::from_secs(options.request_timeout_secs));
        if let Some(proxy) = options.proxy.as_deref().filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| LlmError::Connection(format!("invalid proxy `{proxy}`: {e}")))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| LlmError::Connection(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", options.base_url.trim_end_matches('/')),
            model: options.model,
            api_key: options.api_key.unwrap_or_else(|| "empty".to_string()),
            temperature: options.temperature,
        })
    }

    fn wire_message(m: &Message) -> Value {
        let role = match m.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "function",
        };
        let mut msg = json!({ "role": role, "content": m.content });
        if let Some(name) = &m.name {
            msg["name"] = json!(name);
        }
        if let Some(call) = &m.function_call {
            msg["function_call"] = json!({ "name": call.name, "arguments": call.arguments });
        }
        msg
    }

    /// 组装请求体（不含网络调用，便于测试）
    pub fn request_body(&self, messages: &[Message], tools: Option<&[ToolSpec]>) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "stream": false,
            "messages": messages.iter().map(Self::wire_message).collect::<Vec<_>>(),
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["functions"] = Value::Array(tools.iter().map(ToolSpec::to_function_json).collect());
        }
        body
    }
}

fn map_send_error(e: reqwest::Error) -> LlmError {
    if e.is_connect() || e.is_timeout() {
        LlmError::Connection(e.to_string())
    } else {
        LlmError::Backend(e.to_string())
    }
}

/// 把响应体解析为 ModelReply
pub fn parse_reply(body: &str) -> Result<ModelReply, LlmError> {
    let resp: CompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Backend(format!("invalid completion response: {e}")))?;
    let message = resp
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| LlmError::Backend("completion response has no choices".to_string()))?;
    let content = message.content.unwrap_or_default();
    Ok(match message.function_call {
        Some(call) => ModelReply::FunctionCall { content, call },
        None => ModelReply::Text(content),
    })
}

#[async_trait]
impl ModelBackend for ChatGlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<&[ToolSpec]>,
    ) -> Result<ModelReply, LlmError> {
        let body = self.request_body(messages, tools);
        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            functions = tools.map(|t| t.len()).unwrap_or(0),
            "chatglm request"
        );
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(map_send_error)?;
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(LlmError::Auth(text)),
            s if !s.is_success() => Err(LlmError::Backend(format!("{s}: {text}"))),
            _ => parse_reply(&text),
        }
    }

    fn name(&self) -> &str {
        "chatglm"
    }
}
