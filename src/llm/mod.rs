//! LLM 层：模型后端抽象与实现（ChatGLM 兼容 / OpenAI 兼容 / Mock）

pub mod chatglm;
pub mod mock;
pub mod openai;
pub mod traits;

pub use chatglm::{ChatGlmClient, ChatGlmOptions};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmError, ModelBackend, ModelReply};
