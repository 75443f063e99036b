//! wxbot - 微信聊天机器人核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排器（模式命令 / 模型调用 / 工具与代码执行循环）、错误、构建、关闭
//! - **delivery**: 消息发送与图片落盘（外部协作方接口）
//! - **kernel**: 常驻代码执行内核（进程、协议、会话）
//! - **llm**: 模型后端抽象与实现（ChatGLM 兼容 / OpenAI 兼容 / Mock）
//! - **memory**: 按 (peer, mode) 划分的有界对话历史
//! - **observability**: 日志初始化
//! - **tools**: 工具注册表、执行器与内置工具（天气、时间、新闻）

pub mod config;
pub mod core;
pub mod delivery;
pub mod kernel;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;

pub use crate::core::{Orchestrator, OrchestratorBuilder};
