//! 记忆层：按 (peer, mode) 的短期对话历史

pub mod conversation;

pub use conversation::{ConversationStore, FunctionCall, Message, Mode, Role};
