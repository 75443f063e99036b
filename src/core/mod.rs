//! 核心编排层：错误、模式命令、主控循环、构建、会话监管、优雅关闭

pub mod builder;
pub mod commands;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod shutdown;

pub use builder::{value_check, OrchestratorBuilder};
pub use commands::ModeCommand;
pub use error::{AgentError, KernelError, RegistryError};
pub use orchestrator::{error_text, Orchestrator, IMAGE_MARKER, INTERPRETER};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    run_with_graceful_shutdown, KernelCleanup, ShutdownCleanup, ShutdownCoordinator,
    ShutdownManager, ShutdownReason,
};
