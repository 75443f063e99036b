//! 编排器：单条用户消息的主控循环
//!
//! 模式命令在调用模型之前拦截；其余消息写入 (peer, mode) 会话后进入最多 max_rounds 轮的循环：
//! - 模型返回函数调用：分发给工具，调用与结果各写一条历史，继续下一轮
//! - 模型文本中带 `interpreter` 与围栏代码块：交给代码内核执行，结果写入历史，继续下一轮；
//!   执行失败（异常、超时、内核错误）时本回合直接结束
//! - 其它纯文本：作为最终回复写入历史并返回
//!
//! 图片结果落盘并发送给 peer，历史中只记 `[Image]`。整个回合受取消令牌与期限约束。
//! 同一 peer 的回合串行执行，不同 peer 互不阻塞；代码内核为所有 peer 共享。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::core::commands::ModeCommand;
use crate::core::{AgentError, KernelError, SessionSupervisor};
use crate::delivery::{ImageStore, MessageSender};
use crate::kernel::{code_directive, sanitize_code, KernelSession};
use crate::llm::{ModelBackend, ModelReply};
use crate::memory::{ConversationStore, FunctionCall, Message, Mode};
use crate::tools::{ToolCallResult, ToolExecutor, ToolSpec};

/// 历史中代替图片内容的标记
pub const IMAGE_MARKER: &str = "[Image]";
/// 代码执行结果在历史中的工具名
pub const INTERPRETER: &str = "interpreter";

pub struct Orchestrator {
    backend: Arc<dyn ModelBackend>,
    tools: ToolExecutor,
    tool_specs: Vec<ToolSpec>,
    kernel: Arc<KernelSession>,
    store: ConversationStore,
    sender: Arc<dyn MessageSender>,
    images: Arc<dyn ImageStore>,
    max_rounds: usize,
    supervisor: SessionSupervisor,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        tools: ToolExecutor,
        kernel: Arc<KernelSession>,
        store: ConversationStore,
        sender: Arc<dyn MessageSender>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        let tool_specs = tools.describe();
        Self {
            backend,
            tools,
            tool_specs,
            kernel,
            store,
            sender,
            images,
            max_rounds: 5,
            supervisor: SessionSupervisor::default(),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn kernel(&self) -> &Arc<KernelSession> {
        &self.kernel
    }

    pub fn supervisor(&self) -> &SessionSupervisor {
        &self.supervisor
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn tool_specs(&self) -> &[ToolSpec] {
        &self.tool_specs
    }

    /// 处理一条用户消息，返回要回复给 peer 的文本；任何失败都转为文本。
    /// 模式命令同样排在该 peer 进行中的回合之后。
    pub async fn handle(&self, peer: &str, text: &str) -> String {
        let lock = self.turn_lock(peer);
        let _guard = lock.lock().await;

        if let Some(cmd) = ModeCommand::parse(text) {
            return self.apply_command(peer, cmd);
        }

        let mode = self.store.mode(peer);
        tracing::info!(peer = %peer, mode = %mode, backend = %self.backend.name(), "turn started");
        self.store.append(peer, mode, Message::user(text));

        match self.supervisor.run_turn(self.run_rounds(peer, mode)).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer = %peer, mode = %mode, error = %e, "turn failed");
                error_text(&e)
            }
        }
    }

    fn apply_command(&self, peer: &str, cmd: ModeCommand) -> String {
        match cmd {
            ModeCommand::Help => {}
            ModeCommand::Switch(mode) => self.store.set_mode(peer, mode),
            ModeCommand::ClearMode => self.store.reset(peer, self.store.mode(peer)),
            ModeCommand::ClearAll => self.store.reset_all(peer),
        }
        tracing::info!(peer = %peer, command = ?cmd, "mode command");
        cmd.acknowledgement().to_string()
    }

    fn turn_lock(&self, peer: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(peer.to_string()).or_default().clone()
    }

    async fn run_rounds(&self, peer: &str, mode: Mode) -> Result<String, AgentError> {
        let tools = (mode == Mode::Tool).then_some(self.tool_specs.as_slice());
        let mut last_text: Option<String> = None;

        for round in 1..=self.max_rounds {
            let view = self.store.view(peer, mode);
            let reply = self.backend.complete(&view, tools).await?;

            match reply {
                ModelReply::FunctionCall { content, call } => {
                    tracing::info!(peer = %peer, round, tool = %call.name, "function call");
                    let observation = self.call_tool(peer, &call).await;
                    if !content.trim().is_empty() {
                        last_text = Some(content.clone());
                    }
                    let name = call.name.clone();
                    self.store
                        .append(peer, mode, Message::assistant_call(content, call));
                    self.store.append(peer, mode, Message::tool(name, observation));
                }
                ModelReply::Text(content) => {
                    let Some(code) = code_directive(&content) else {
                        self.store
                            .append(peer, mode, Message::assistant(content.clone()));
                        return Ok(content);
                    };
                    tracing::info!(peer = %peer, round, "code directive");
                    match self.run_code(peer, &sanitize_code(&code)).await {
                        Ok(observation) => {
                            self.store
                                .append(peer, mode, Message::assistant(content.clone()));
                            self.store
                                .append(peer, mode, Message::tool(INTERPRETER, observation));
                            last_text = Some(content);
                        }
                        Err(e) => {
                            let answer = format!("代码执行错误: {e}");
                            self.store
                                .append(peer, mode, Message::assistant(answer.clone()));
                            return Ok(answer);
                        }
                    }
                }
            }
        }

        tracing::warn!(peer = %peer, max_rounds = self.max_rounds, "round budget exhausted");
        let answer = last_text
            .unwrap_or_else(|| error_text(&AgentError::RetryBudgetExhausted(self.max_rounds)));
        self.store.append(peer, mode, Message::assistant(answer.clone()));
        Ok(answer)
    }

    async fn call_tool(&self, peer: &str, call: &FunctionCall) -> String {
        let raw = call.arguments.trim();
        let args = if raw.is_empty() {
            Ok(Value::Object(Default::default()))
        } else {
            serde_json::from_str::<Value>(raw)
        };
        match args {
            Ok(args) => {
                let result = self.tools.execute(&call.name, args).await;
                self.deliver(peer, result, false).await
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "function call arguments are not valid JSON");
                format!("Invalid arguments for `{}`: {e}", call.name)
            }
        }
    }

    async fn run_code(&self, peer: &str, code: &str) -> Result<String, KernelError> {
        self.sender
            .send_text(peer, &format!("代码如下：\n{code}"), None)
            .await;
        self.sender.send_text(peer, "执行代码...", None).await;

        let result = self.kernel.execute(code).await?;
        Ok(self.deliver(peer, result, true).await)
    }

    /// 把结果转为写入历史的文本；图片落盘并发送，`progress` 为真时把文本结果也发给 peer
    async fn deliver(&self, peer: &str, result: ToolCallResult, progress: bool) -> String {
        match result {
            ToolCallResult::Text(text) => {
                if progress {
                    self.sender
                        .send_text(peer, &format!("执行结果:\n{text}"), None)
                        .await;
                }
                text
            }
            ToolCallResult::Error(text) => text,
            ToolCallResult::Image { data, filename } => {
                match self.images.save(&data, filename.as_deref()).await {
                    Ok(path) => {
                        self.sender.send_image(peer, &path).await;
                        IMAGE_MARKER.to_string()
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to save image result");
                        format!("Failed to save image: {e}")
                    }
                }
            }
        }
    }
}

/// 回合失败时回复给 peer 的文本
pub fn error_text(e: &AgentError) -> String {
    match e {
        AgentError::DeadlineExceeded(after) => {
            format!("处理超时（{} 秒），请稍后再试", seconds_text(*after))
        }
        AgentError::Cancelled => "任务已取消".to_string(),
        AgentError::RetryBudgetExhausted(rounds) => {
            format!("抱歉，未能在 {rounds} 轮内完成，请换个说法再试")
        }
        other => format!("发生未知错误：{other}"),
    }
}

/// 整秒显示为整数，其余保留一位小数
fn seconds_text(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        d.as_secs().to_string()
    } else {
        format!("{:.1}", d.as_secs_f64())
    }
}
