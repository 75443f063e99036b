//! 短期记忆：按 (peer, mode) 划分的对话历史
//!
//! 每个会话首次使用时以该模式的系统消息初始化；超过 max_messages 时滚动清除
//! 置顶前缀之后最旧的一条。不跨进程持久化。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

/// 消息角色（与 LLM API 一致；Tool 对应 function/observation 结果）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 模型发出的结构化函数调用
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON 字符串形式的参数
    pub arguments: String,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Tool 消息对应的工具名（代码执行结果为 "interpreter"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            function_call: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// 带函数调用的 assistant 消息
    pub fn assistant_call(content: impl Into<String>, call: FunctionCall) -> Self {
        Self {
            function_call: Some(call),
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(Role::Tool, content)
        }
    }
}

/// 对话模式：决定置顶系统提示词与回复的解释分支
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Chat,
    Tool,
    Code,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Chat, Mode::Tool, Mode::Code];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Tool => "tool",
            Mode::Code => "code",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个会话：有序消息 + 置顶前缀长度
#[derive(Clone, Debug)]
struct Conversation {
    messages: Vec<Message>,
    pinned: usize,
}

impl Conversation {
    fn fresh(system: &[String], pinned: usize) -> Self {
        Self {
            messages: system.iter().cloned().map(Message::system).collect(),
            pinned,
        }
    }

    /// 追加后若超长，删除置顶前缀之后最旧的一条；返回是否发生了清除
    fn push(&mut self, msg: Message, max: usize) -> bool {
        self.messages.push(msg);
        let mut evicted = false;
        while self.messages.len() > max && self.messages.len() > self.pinned {
            self.messages.remove(self.pinned);
            evicted = true;
        }
        evicted
    }
}

type Key = (String, Mode);

/// 会话存储：每个 (peer, mode) 一把锁，外层 map 只在创建/重置时写锁
///
/// 同时记录每个 peer 当前所处的模式（默认 chat）。
pub struct ConversationStore {
    max_messages: usize,
    pinned_prefix: Option<usize>,
    system: HashMap<Mode, Vec<String>>,
    conversations: RwLock<HashMap<Key, Arc<Mutex<Conversation>>>>,
    modes: RwLock<HashMap<String, Mode>>,
}

impl ConversationStore {
    /// `system` 为各模式的置顶系统消息；缺省的模式没有系统消息
    pub fn new(max_messages: usize, system: HashMap<Mode, Vec<String>>) -> Self {
        Self {
            max_messages: max_messages.max(1),
            pinned_prefix: None,
            system,
            conversations: RwLock::new(HashMap::new()),
            modes: RwLock::new(HashMap::new()),
        }
    }

    /// 固定受保护的前缀长度（1 即只保护第一条消息）；默认保护模式的全部系统消息
    pub fn with_pinned_prefix(mut self, pinned: usize) -> Self {
        self.pinned_prefix = Some(pinned);
        self
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    fn system_for(&self, mode: Mode) -> &[String] {
        self.system.get(&mode).map(Vec::as_slice).unwrap_or(&[])
    }

    fn pinned_for(&self, mode: Mode) -> usize {
        let pinned = self
            .pinned_prefix
            .unwrap_or_else(|| self.system_for(mode).len());
        // 至少留一个可清除的位置，否则窗口无法保持有界
        pinned.min(self.max_messages.saturating_sub(1))
    }

    fn fresh(&self, mode: Mode) -> Conversation {
        Conversation::fresh(self.system_for(mode), self.pinned_for(mode))
    }

    fn entry(&self, peer: &str, mode: Mode) -> Arc<Mutex<Conversation>> {
        let key = (peer.to_string(), mode);
        if let Some(conv) = read(&self.conversations).get(&key) {
            return conv.clone();
        }
        write(&self.conversations)
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(self.fresh(mode))))
            .clone()
    }

    /// 追加一条消息（会话不存在时先以系统消息初始化）
    pub fn append(&self, peer: &str, mode: Mode, msg: Message) {
        let conv = self.entry(peer, mode);
        let mut conv = lock(&conv);
        if conv.push(msg, self.max_messages) {
            tracing::debug!(peer = %peer, mode = %mode, "滚动清除对话记录");
        }
    }

    /// 当前会话的完整消息序列（提交给模型）
    pub fn view(&self, peer: &str, mode: Mode) -> Vec<Message> {
        let conv = self.entry(peer, mode);
        let conv = lock(&conv);
        conv.messages.clone()
    }

    /// 清除某模式的会话，仅保留系统消息
    pub fn reset(&self, peer: &str, mode: Mode) {
        let fresh = self.fresh(mode);
        write(&self.conversations).insert((peer.to_string(), mode), Arc::new(Mutex::new(fresh)));
    }

    /// 清除该 peer 的全部模式会话
    pub fn reset_all(&self, peer: &str) {
        for mode in Mode::ALL {
            self.reset(peer, mode);
        }
    }

    pub fn mode(&self, peer: &str) -> Mode {
        read(&self.modes).get(peer).copied().unwrap_or_default()
    }

    pub fn set_mode(&self, peer: &str, mode: Mode) {
        write(&self.modes).insert(peer.to_string(), mode);
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize, system: Vec<&str>) -> ConversationStore {
        let system: Vec<String> = system.into_iter().map(String::from).collect();
        let map = Mode::ALL.iter().map(|m| (*m, system.clone())).collect();
        ConversationStore::new(max, map)
    }

    #[test]
    fn test_lazy_init_with_system_prompt() {
        let s = store(10, vec!["sys"]);
        let view = s.view("wxid_a", Mode::Chat);
        assert_eq!(view, vec![Message::system("sys")]);
    }

    #[test]
    fn test_eleventh_message_evicts_oldest_non_pinned() {
        let s = store(10, vec!["sys"]);
        for i in 1..=10 {
            s.append("p", Mode::Chat, Message::user(format!("m{i}")));
        }
        let view = s.view("p", Mode::Chat);
        assert_eq!(view.len(), 10);
        assert_eq!(view[0], Message::system("sys"));
        // 第 2 条（m1）被清除，m2 成为最旧的非置顶消息
        assert_eq!(view[1].content, "m2");
        assert_eq!(view[9].content, "m10");
    }

    #[test]
    fn test_bounded_after_many_appends() {
        let s = store(4, vec!["a", "b"]);
        for i in 0..50 {
            s.append("p", Mode::Tool, Message::assistant(i.to_string()));
            let view = s.view("p", Mode::Tool);
            assert!(view.len() <= 4);
            assert_eq!(view[0].content, "a");
            assert_eq!(view[1].content, "b");
        }
    }

    #[test]
    fn test_legacy_pinned_prefix_of_one_evicts_second_system_message() {
        let s = store(3, vec!["a", "b"]).with_pinned_prefix(1);
        s.append("p", Mode::Chat, Message::user("u1"));
        s.append("p", Mode::Chat, Message::user("u2"));
        let view = s.view("p", Mode::Chat);
        let contents: Vec<_> = view.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "u1", "u2"]);
    }

    #[test]
    fn test_reset_and_reset_all() {
        let s = store(10, vec!["sys"]);
        s.append("p", Mode::Chat, Message::user("hello"));
        s.append("p", Mode::Code, Message::user("print(1)"));
        s.reset("p", Mode::Chat);
        assert_eq!(s.view("p", Mode::Chat).len(), 1);
        assert_eq!(s.view("p", Mode::Code).len(), 2);
        s.reset_all("p");
        assert_eq!(s.view("p", Mode::Code).len(), 1);
    }

    #[test]
    fn test_peers_and_modes_are_isolated() {
        let s = store(10, vec!["sys"]);
        s.append("a", Mode::Chat, Message::user("from a"));
        assert_eq!(s.view("b", Mode::Chat).len(), 1);
        assert_eq!(s.view("a", Mode::Tool).len(), 1);
        s.set_mode("a", Mode::Code);
        assert_eq!(s.mode("a"), Mode::Code);
        assert_eq!(s.mode("b"), Mode::Chat);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_stay_bounded() {
        let s = Arc::new(store(10, vec!["sys"]));
        let mut handles = Vec::new();
        for peer in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    s.append(&format!("p{peer}"), Mode::Chat, Message::user(i.to_string()));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        for peer in 0..8 {
            let view = s.view(&format!("p{peer}"), Mode::Chat);
            assert_eq!(view.len(), 10);
            assert_eq!(view[0].role, Role::System);
            assert_eq!(view[9].content, "99");
        }
    }
}
