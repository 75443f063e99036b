//! 参数声明生成（schemars 从参数结构体自动生成 Schema）
//!
//! 工具的参数写成 `#[derive(Deserialize, JsonSchema)]` 结构体，字段文档注释即参数描述，
//! `Option<T>` 字段为非必填。无法解析为基本类型的字段保留原样，由注册表校验时拒绝。

use schemars::schema::{InstanceType, Schema, SingleOrVec};
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::tools::ParamSpec;

/// 由参数结构体的 JSON Schema 生成 ParamSpec 列表
pub fn params_from_schema<T: JsonSchema>() -> Vec<ParamSpec> {
    let root = schema_for!(T);
    let Some(object) = root.schema.object.as_ref() else {
        return Vec::new();
    };
    object
        .properties
        .iter()
        .map(|(name, schema)| {
            let (ty, description) = match schema {
                Schema::Object(obj) => (
                    type_name(obj.instance_type.as_ref(), obj.reference.as_deref()),
                    obj.metadata
                        .as_ref()
                        .and_then(|m| m.description.clone())
                        .unwrap_or_default(),
                ),
                Schema::Bool(_) => ("any".to_string(), String::new()),
            };
            ParamSpec {
                name: name.clone(),
                ty,
                description,
                required: object.required.contains(name),
            }
        })
        .collect()
}

fn type_name(instance: Option<&SingleOrVec<InstanceType>>, reference: Option<&str>) -> String {
    let single = match instance {
        Some(SingleOrVec::Single(t)) => Some(**t),
        // Option<T> 生成 [T, null]
        Some(SingleOrVec::Vec(types)) => types.iter().copied().find(|t| *t != InstanceType::Null),
        None => None,
    };
    match single {
        Some(InstanceType::String) => "string".to_string(),
        Some(InstanceType::Integer) => "integer".to_string(),
        Some(InstanceType::Number) => "number".to_string(),
        Some(InstanceType::Boolean) => "boolean".to_string(),
        Some(InstanceType::Array) => "array".to_string(),
        Some(InstanceType::Object) => "object".to_string(),
        Some(InstanceType::Null) | None => reference.unwrap_or("unknown").to_string(),
    }
}

/// 把模型给出的参数反序列化为工具的参数结构体；失败信息回给模型
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))
}
