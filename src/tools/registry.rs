//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / params / execute）。注册时校验元数据并生成 ToolSpec，
//! 之后不可变；dispatch 按名调用，任何失败（未找到、返回错误、panic）都转为文本结果，不会向上抛出。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::RegistryError;

/// 可被解析的参数类型名（JSON Schema 基本类型）
pub const KNOWN_TYPES: &[&str] = &["string", "integer", "number", "boolean", "array", "object"];

/// 单个参数的声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub description: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn new(name: &str, ty: &str, description: &str, required: bool) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.to_string(),
            description: description.to_string(),
            required,
        }
    }
}

/// 工具描述：启动时生成一次，之后只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    /// 转为 OpenAI 兼容 `functions` 条目（parameters 为 JSON Schema）
    pub fn to_function_json(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for p in &self.params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({ "type": p.ty, "description": p.description }),
            );
            if p.required {
                required.push(Value::String(p.name.clone()));
            }
        }
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        })
    }
}

/// 工具 / 代码执行的统一结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallResult {
    Text(String),
    /// 图片字节（PNG）；filename 为工具建议的文件名
    Image {
        data: Vec<u8>,
        filename: Option<String>,
    },
    /// 失败说明，作为工具输出回灌给模型
    Error(String),
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数声明、异步执行（args 为 JSON 对象）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数声明；默认无参数
    fn params(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    async fn execute(&self, args: Value) -> Result<ToolCallResult, String>;
}

struct Entry {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按注册顺序保存 ToolSpec，按名查找实现
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 校验元数据并注册；任何缺失或非法都返回 RegistryError（调用方应在启动时直接失败）
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = build_spec(tool.as_ref())?;
        if self.index.contains_key(&spec.name) {
            return Err(RegistryError::DuplicateTool(spec.name));
        }
        tracing::debug!(tool = %spec.name, params = spec.params.len(), "registered tool");
        self.index.insert(spec.name.clone(), self.entries.len());
        self.entries.push(Entry { spec, tool });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.spec.name.clone()).collect()
    }

    /// 所有工具描述的副本
    pub fn describe(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|e| e.spec.clone()).collect()
    }

    /// 按名调用工具；总能返回结果
    pub async fn dispatch(&self, name: &str, args: Value) -> ToolCallResult {
        let Some(&idx) = self.index.get(name) else {
            return ToolCallResult::Text(not_found(name));
        };
        let tool = self.entries[idx].tool.clone();
        match AssertUnwindSafe(tool.execute(args)).catch_unwind().await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolCallResult::Error(format_trace(name, &e)),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(tool = %name, panic = %msg, "tool panicked");
                ToolCallResult::Error(format_trace(name, &format!("panicked: {msg}")))
            }
        }
    }
}

/// 未注册工具的哨兵文本
pub fn not_found(name: &str) -> String {
    format!("Tool `{name}` not found. Please use a provided tool.")
}

fn format_trace(name: &str, err: &str) -> String {
    format!("Traceback (most recent call last):\n  tool `{name}`\nError: {err}")
}

fn build_spec(tool: &dyn Tool) -> Result<ToolSpec, RegistryError> {
    let name = tool.name().trim().to_string();
    if name.is_empty() {
        return Err(RegistryError::InvalidSchema {
            tool: name,
            reason: "empty tool name".to_string(),
        });
    }
    let description = tool.description().trim().to_string();
    if description.is_empty() {
        return Err(RegistryError::MissingDescription(name));
    }
    let params = tool.params();
    for p in &params {
        if p.name.trim().is_empty() {
            return Err(RegistryError::InvalidSchema {
                tool: name,
                reason: "parameter with empty name".to_string(),
            });
        }
        if p.description.trim().is_empty() {
            return Err(RegistryError::MissingParamDescription {
                tool: name,
                param: p.name.clone(),
            });
        }
        if !KNOWN_TYPES.contains(&p.ty.as_str()) {
            return Err(RegistryError::UnresolvedType {
                tool: name,
                param: p.name.clone(),
                ty: p.ty.clone(),
            });
        }
    }
    Ok(ToolSpec {
        name,
        description,
        params,
    })
}
