//! 代码执行内核：消息协议、传输抽象、子进程实现与会话

pub mod bridge;
pub mod mock;
pub mod process;
pub mod protocol;
pub mod session;
pub mod transport;

pub use mock::{MockKernel, MockReply};
pub use process::{ProcessKernel, ProcessKernelConfig};
pub use protocol::{code_directive, extract_code, sanitize_code, ExecutionState, KernelMessage};
pub use session::KernelSession;
pub use transport::KernelTransport;
