//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(tool_name, args) 在超时内调用 registry.dispatch；
//! 超时转为 ToolCallResult::Error；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::tools::{ToolCallResult, ToolRegistry, ToolSpec};

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具；结果总是 ToolCallResult，输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> ToolCallResult {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.dispatch(tool_name, args))
            .await
            .unwrap_or_else(|_| {
                ToolCallResult::Error(format!(
                    "Tool `{}` timed out after {}s",
                    tool_name,
                    self.timeout.as_secs()
                ))
            });

        let outcome = match &result {
            ToolCallResult::Text(_) => "text",
            ToolCallResult::Image { .. } => "image",
            ToolCallResult::Error(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": !matches!(result, ToolCallResult::Error(_)),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result
    }

    pub fn describe(&self) -> Vec<ToolSpec> {
        self.registry.describe()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl Tool for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<ToolCallResult, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ToolCallResult::Text("woke".to_string()))
        }
    }

    #[tokio::test]
    async fn test_timeout_becomes_error_text() {
        let mut reg = ToolRegistry::new();
        reg.register(Sleepy).unwrap();
        let exec = ToolExecutor::new(reg, 1);
        let out = exec.execute("sleepy", serde_json::json!({})).await;
        assert_eq!(
            out,
            ToolCallResult::Error("Tool `sleepy` timed out after 1s".to_string())
        );
    }

    #[test]
    fn test_args_preview_truncates_on_char_boundary() {
        let long = serde_json::json!({ "text": "天".repeat(300) });
        let preview = args_preview(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
