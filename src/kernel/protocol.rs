//! 内核消息格式（Jupyter 消息协议的子集）
//!
//! 每条消息一行 JSON：`channel` 指明 shell（请求/回执）、iopub（输出与状态广播）或 control；
//! 回执与输出通过 `parent_header.msg_id` 关联到请求。输出按 MIME 键选择：`image/png` 为 base64 图片，
//! `text/plain` 为文本；流输出带 `text` 字段。

use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::KernelError;
use crate::tools::ToolCallResult;

pub const IMAGE_PNG: &str = "image/png";
pub const TEXT_PLAIN: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Control,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub msg_id: String,
    #[serde(default)]
    pub msg_type: String,
}

impl Header {
    fn new(msg_type: &str) -> Self {
        Self {
            msg_id: uuid::Uuid::new_v4().simple().to_string(),
            msg_type: msg_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    pub channel: Channel,
    pub header: Header,
    #[serde(default)]
    pub parent_header: Header,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    pub fn new(channel: Channel, msg_type: &str, content: Value) -> Self {
        Self {
            channel,
            header: Header::new(msg_type),
            parent_header: Header::default(),
            metadata: json!({}),
            content,
        }
    }

    pub fn execute_request(code: &str) -> Self {
        Self::new(
            Channel::Shell,
            "execute_request",
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    pub fn kernel_info_request() -> Self {
        Self::new(Channel::Shell, "kernel_info_request", json!({}))
    }

    pub fn interrupt_request() -> Self {
        Self::new(Channel::Control, "interrupt_request", json!({}))
    }

    pub fn shutdown_request(restart: bool) -> Self {
        Self::new(Channel::Control, "shutdown_request", json!({ "restart": restart }))
    }

    /// 以 `parent` 为父消息构造回复/广播（测试与模拟内核使用）
    pub fn reply(parent: &KernelMessage, channel: Channel, msg_type: &str, content: Value) -> Self {
        Self {
            parent_header: parent.header.clone(),
            ..Self::new(channel, msg_type, content)
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    pub fn is_child_of(&self, msg_id: &str) -> bool {
        self.parent_header.msg_id == msg_id
    }

    /// 回执中的执行状态：ok / error / aborted
    pub fn status(&self) -> Option<&str> {
        self.content
            .get("status")
            .or_else(|| self.metadata.get("status"))
            .and_then(Value::as_str)
    }

    /// iopub `status` 消息中的 execution_state
    pub fn execution_state(&self) -> Option<&str> {
        self.content.get("execution_state").and_then(Value::as_str)
    }

    pub fn is_idle(&self) -> bool {
        self.execution_state() == Some("idle")
    }

    /// 是否是携带结果的输出（stream / execute_result / display_data / error）
    pub fn is_output(&self) -> bool {
        matches!(
            self.msg_type(),
            "stream" | "execute_result" | "display_data" | "update_display_data" | "error"
        )
    }

    /// 回执中的 traceback，逐行清理控制字符后以换行连接
    pub fn traceback(&self) -> String {
        format_traceback(&self.content)
    }
}

/// 把 error 内容中的 traceback 列表清理为文本；缺失时退回 `ename: evalue`
pub fn format_traceback(content: &Value) -> String {
    let lines: Vec<String> = content
        .get("traceback")
        .and_then(Value::as_array)
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(|l| l.trim_end_matches('\n').to_string())
                .collect()
        })
        .unwrap_or_default();
    if lines.is_empty() {
        let ename = content.get("ename").and_then(Value::as_str);
        let evalue = content.get("evalue").and_then(Value::as_str);
        return match (ename, evalue) {
            (Some(n), Some(v)) => clean_ansi_codes(&format!("{n}: {v}")),
            _ => "Traceback Error".to_string(),
        };
    }
    clean_ansi_codes(&lines.join("\n"))
}

/// 内核最近一次已知的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Busy,
    Dead,
}

static ANSI_RE: OnceLock<Regex> = OnceLock::new();

/// 去除 ANSI 转义序列与其它控制字符（保留换行与制表符）
pub fn clean_ansi_codes(input: &str) -> String {
    let re = ANSI_RE.get_or_init(|| Regex::new(r"(\x{9B}|\x1B\[)[0-?]*[ -/]*[@-~]").unwrap());
    re.replace_all(input, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// 把最后一条输出的 content 归一为 ToolCallResult
///
/// 流输出取 `text`；富输出优先 `image/png`（base64 解码为字节），其次 `text/plain`；
/// 其它内容以 JSON 文本返回。
pub fn classify_output(content: &Value) -> Result<ToolCallResult, KernelError> {
    if let Some(text) = content.get("text").and_then(Value::as_str) {
        return Ok(ToolCallResult::Text(text.to_string()));
    }
    if let Some(data) = content.get("data").and_then(Value::as_object) {
        if let Some((_, png)) = data.iter().find(|(k, _)| k.contains(IMAGE_PNG)) {
            let encoded: String = png
                .as_str()
                .unwrap_or_default()
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| KernelError::Protocol(format!("invalid image payload: {e}")))?;
            return Ok(ToolCallResult::Image {
                data: bytes,
                filename: None,
            });
        }
        if let Some((_, text)) = data.iter().find(|(k, _)| k.contains(TEXT_PLAIN)) {
            let text = text
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| text.to_string());
            return Ok(ToolCallResult::Text(text));
        }
        return Ok(ToolCallResult::Text(Value::Object(data.clone()).to_string()));
    }
    if content.get("traceback").is_some() {
        return Ok(ToolCallResult::Text(format_traceback(content)));
    }
    Ok(ToolCallResult::Text(content.to_string()))
}

/// 模型输出中可能夹带、需要在执行前去掉的对话控制标记
const ROLE_MARKERS: &[&str] = &[
    "<|observation|>",
    "<|assistant|>interpreter",
    "<|assistant|>",
    "<|user|>",
    "<|system|>",
];

static CODE_BLOCK_RE: OnceLock<Regex> = OnceLock::new();

fn code_block_re() -> &'static Regex {
    CODE_BLOCK_RE.get_or_init(|| Regex::new(r"(?s)```([^\n]*)\n(.*?)```").unwrap())
}

/// 取文本中最后一个 ``` 围栏代码块的内容
pub fn extract_code(text: &str) -> Option<String> {
    code_block_re()
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(2))
        .map(|m| m.as_str().to_string())
}

/// 去掉对话控制标记与首尾空白
pub fn sanitize_code(code: &str) -> String {
    let mut code = code.to_string();
    for marker in ROLE_MARKERS {
        code = code.replace(marker, "");
    }
    code.trim().to_string()
}

/// 代码指令：文本中出现 `interpreter` 且其后带围栏代码块时，返回最后一个代码块
pub fn code_directive(text: &str) -> Option<String> {
    let pos = text.find("interpreter")?;
    if !code_block_re().is_match(&text[pos..]) {
        return None;
    }
    extract_code(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_ansi_codes() {
        let raw = "\u{1b}[0;31mZeroDivisionError\u{1b}[0m: division by zero\u{7}";
        assert_eq!(clean_ansi_codes(raw), "ZeroDivisionError: division by zero");
        assert_eq!(clean_ansi_codes("a\n\tb"), "a\n\tb");
    }

    #[test]
    fn test_message_roundtrip_with_empty_parent() {
        let line = r#"{"channel":"iopub","header":{"msg_id":"x","msg_type":"status"},"parent_header":{},"content":{"execution_state":"idle"}}"#;
        let msg: KernelMessage = serde_json::from_str(line).unwrap();
        assert!(msg.is_idle());
        assert_eq!(msg.parent_header.msg_id, "");
        assert!(!msg.is_output());
    }

    #[test]
    fn test_classify_stream_and_plain() {
        let out = classify_output(&json!({"name": "stdout", "text": "hi\n"})).unwrap();
        assert_eq!(out, ToolCallResult::Text("hi\n".to_string()));
        let out = classify_output(&json!({"data": {"text/plain": "2"}})).unwrap();
        assert_eq!(out, ToolCallResult::Text("2".to_string()));
    }

    #[test]
    fn test_classify_prefers_png() {
        let png = base64::engine::general_purpose::STANDARD.encode([0x89, b'P', b'N', b'G']);
        let out = classify_output(&json!({"data": {"text/plain": "<Figure>", "image/png": png}}))
            .unwrap();
        assert_eq!(
            out,
            ToolCallResult::Image {
                data: vec![0x89, b'P', b'N', b'G'],
                filename: None
            }
        );
    }

    #[test]
    fn test_classify_falls_back_to_text() {
        let out = classify_output(&json!({"data": {"text/html": "<b>x</b>"}})).unwrap();
        assert_eq!(out, ToolCallResult::Text(r#"{"text/html":"<b>x</b>"}"#.to_string()));
        assert!(classify_output(&json!({"data": {"image/png": "%%%"}})).is_err());
    }

    #[test]
    fn test_traceback_is_cleaned() {
        let parent = KernelMessage::execute_request("1/0");
        let reply = KernelMessage::reply(
            &parent,
            Channel::Shell,
            "execute_reply",
            json!({
                "status": "error",
                "traceback": ["\u{1b}[0;31mTraceback\u{1b}[0m\n", "ZeroDivisionError: division by zero"],
            }),
        );
        assert!(reply.is_child_of(parent.msg_id()));
        assert_eq!(reply.status(), Some("error"));
        assert_eq!(reply.traceback(), "Traceback\nZeroDivisionError: division by zero");
    }

    #[test]
    fn test_extract_last_code_block() {
        let text = "先看这个\n```python\nx = 1\n```\n然后\n```python\nprint(x + 1)\n```";
        assert_eq!(extract_code(text).as_deref(), Some("print(x + 1)\n"));
        assert!(extract_code("no code here").is_none());
    }

    #[test]
    fn test_sanitize_code() {
        assert_eq!(
            sanitize_code("<|assistant|>interpreter\nprint(1)\n<|observation|>"),
            "print(1)"
        );
    }

    #[test]
    fn test_code_directive() {
        let reply = "interpreter\n```python\n1+1\n```";
        assert_eq!(code_directive(reply).as_deref(), Some("1+1\n"));
        assert!(code_directive("```python\n1+1\n```").is_none());
        assert!(code_directive("我会用 interpreter 来算").is_none());
    }
}
