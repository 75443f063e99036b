//! 错误类型
//!
//! 分层：注册期错误（RegistryError，启动即失败）、内核错误（KernelError）、
//! 模型后端错误（LlmError，定义于 llm::traits），以及编排层汇总的 AgentError。
//! 工具执行失败不在此列：它们以文本形式回灌给模型。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 工具注册元数据不完整或不合法；属于编程错误，进程启动时直接失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool `{0}` has an empty description")]
    MissingDescription(String),

    #[error("Parameter `{param}` of tool `{tool}` has an empty description")]
    MissingParamDescription { tool: String, param: String },

    #[error("Parameter `{param}` of tool `{tool}` has unresolvable type `{ty}`")]
    UnresolvedType {
        tool: String,
        param: String,
        ty: String,
    },

    #[error("Tool `{0}` registered twice")]
    DuplicateTool(String),

    #[error("Invalid schema for tool `{tool}`: {reason}")]
    InvalidSchema { tool: String, reason: String },
}

/// 代码内核错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// 某次轮询超时且尚未收到执行回执
    #[error("Timed out after {}ms waiting for the kernel", .after.as_millis())]
    Timeout { after: Duration },

    /// 代码执行抛出异常；traceback 已清理控制字符
    #[error("{traceback}")]
    Execution { traceback: String },

    #[error("Kernel session is closed")]
    SessionClosed,

    /// 进程退出或管道断开
    #[error("Kernel crashed: {0}")]
    Crashed(String),

    #[error("Failed to start kernel: {0}")]
    Spawn(String),

    #[error("Kernel protocol error: {0}")]
    Protocol(String),
}

/// 一轮对话中可能出现的错误；编排器将其全部转为面向用户的文本
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Turn deadline exceeded after {}ms", .0.as_millis())]
    DeadlineExceeded(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("Retry budget of {0} rounds exhausted")]
    RetryBudgetExhausted(usize),
}
