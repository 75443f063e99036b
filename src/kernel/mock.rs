//! Mock 内核：按代码片段预设回复，用于测试与无解释器环境

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tokio::sync::Notify;

use crate::core::KernelError;
use crate::kernel::protocol::{Channel, KernelMessage, IMAGE_PNG, TEXT_PLAIN};
use crate::kernel::transport::KernelTransport;

/// 对某段代码的预设反应
#[derive(Debug, Clone)]
pub enum MockReply {
    /// execute_result，text/plain
    Value(String),
    /// stdout 流输出
    Stream(String),
    /// display_data，image/png
    Image(Vec<u8>),
    /// 执行异常，traceback 行
    Error(Vec<String>),
    /// 不回执（触发超时）
    Silent,
    /// 进程崩溃
    Crash,
    /// 依次输出多条（只取 Value / Stream / Image）
    Outputs(Vec<MockReply>),
    /// 正常回复后，在 idle 之后再输出一段 stdout
    AfterIdle { reply: Box<MockReply>, late: String },
}

#[derive(Default)]
struct Queues {
    shell: VecDeque<KernelMessage>,
    iopub: VecDeque<KernelMessage>,
}

pub struct MockKernel {
    replies: HashMap<String, MockReply>,
    queues: Mutex<Queues>,
    notify: Notify,
    alive: AtomicBool,
    crashed: AtomicBool,
    executions: AtomicUsize,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
}

impl Default for MockKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            alive: AtomicBool::new(true),
            crashed: AtomicBool::new(false),
            executions: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    pub fn on(mut self, code: &str, reply: MockReply) -> Self {
        self.replies.insert(code.trim().to_string(), reply);
        self
    }

    /// 预先放入一条 iopub 消息（模拟上一次执行的残留）
    pub fn push_iopub(&self, msg: KernelMessage) {
        self.queues().iopub.push_back(msg);
        self.notify.notify_waiters();
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, req: &KernelMessage) {
        let code = req
            .content
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        let reply = self.replies.get(&code).cloned().unwrap_or_else(|| {
            MockReply::Error(vec![
                "Traceback (most recent call last):".to_string(),
                format!("NameError: name '{}' is not defined", code),
            ])
        });

        let iopub = |msg_type: &str, content| KernelMessage::reply(req, Channel::Iopub, msg_type, content);
        let status = |state: &str| iopub("status", json!({ "execution_state": state }));
        let (outputs, late): (Vec<KernelMessage>, Option<KernelMessage>) = match reply {
            MockReply::Silent => return,
            MockReply::Crash => {
                self.alive.store(false, Ordering::SeqCst);
                self.crashed.store(true, Ordering::SeqCst);
                return;
            }
            MockReply::Error(traceback) => {
                let content = json!({ "ename": "Error", "evalue": "", "traceback": traceback });
                let mut ack = content.clone();
                ack["status"] = json!("error");
                let mut q = self.queues();
                q.iopub.push_back(status("busy"));
                q.iopub.push_back(iopub("error", content));
                q.shell
                    .push_back(KernelMessage::reply(req, Channel::Shell, "execute_reply", ack));
                q.iopub.push_back(status("idle"));
                return;
            }
            MockReply::Outputs(replies) => (
                replies.iter().filter_map(|r| output_message(req, r)).collect(),
                None,
            ),
            MockReply::AfterIdle { reply, late } => (
                output_message(req, &reply).into_iter().collect(),
                Some(iopub("stream", json!({ "name": "stdout", "text": late }))),
            ),
            other => (output_message(req, &other).into_iter().collect(), None),
        };

        let mut q = self.queues();
        q.iopub.push_back(status("busy"));
        q.iopub
            .push_back(iopub("execute_input", json!({ "code": code })));
        q.iopub.extend(outputs);
        q.shell.push_back(KernelMessage::reply(
            req,
            Channel::Shell,
            "execute_reply",
            json!({ "status": "ok" }),
        ));
        q.iopub.push_back(status("idle"));
        q.iopub.extend(late);
    }
}

/// Value / Stream / Image 对应的 iopub 输出消息
fn output_message(req: &KernelMessage, reply: &MockReply) -> Option<KernelMessage> {
    let (msg_type, content) = match reply {
        MockReply::Value(text) => ("execute_result", json!({ "data": { TEXT_PLAIN: text } })),
        MockReply::Stream(text) => ("stream", json!({ "name": "stdout", "text": text })),
        MockReply::Image(bytes) => {
            let png = base64::engine::general_purpose::STANDARD.encode(bytes);
            (
                "display_data",
                json!({ "data": { IMAGE_PNG: png, TEXT_PLAIN: "<Figure>" } }),
            )
        }
        _ => return None,
    };
    Some(KernelMessage::reply(req, Channel::Iopub, msg_type, content))
}

#[async_trait]
impl KernelTransport for MockKernel {
    async fn send(&self, msg: KernelMessage) -> Result<(), KernelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(KernelError::Crashed("mock kernel is down".to_string()));
        }
        match msg.msg_type() {
            "execute_request" => {
                self.executions.fetch_add(1, Ordering::SeqCst);
                self.respond(&msg);
            }
            "kernel_info_request" => {
                let reply = KernelMessage::reply(
                    &msg,
                    Channel::Shell,
                    "kernel_info_reply",
                    json!({ "status": "ok", "implementation": "mock" }),
                );
                self.queues().shell.push_back(reply);
            }
            _ => {}
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recv(
        &self,
        channel: Channel,
        timeout: Duration,
    ) -> Result<Option<KernelMessage>, KernelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.queues();
                let queue = match channel {
                    Channel::Iopub => &mut q.iopub,
                    Channel::Shell | Channel::Control => &mut q.shell,
                };
                if let Some(msg) = queue.pop_front() {
                    return Ok(Some(msg));
                }
            }
            if self.crashed.load(Ordering::SeqCst) {
                return Err(KernelError::Crashed("mock kernel exited".to_string()));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<(), KernelError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        *self.queues() = Queues::default();
        self.crashed.store(false, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.alive.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}
