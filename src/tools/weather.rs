//! 天气工具：查询城市当前天气（wttr.in `format=j1`）
//!
//! 只保留 current_condition 中的温度、体感、湿度、天气描述与观测时间；
//! 请求失败时返回带错误说明的文本，交给模型自行处理。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::tools::schema::{params_from_schema, parse_args};
use crate::tools::{ParamSpec, Tool, ToolCallResult};

const CURRENT_KEYS: &[&str] = &[
    "temp_C",
    "FeelsLikeC",
    "humidity",
    "weatherDesc",
    "observation_time",
];

#[derive(Debug, Deserialize, JsonSchema)]
pub struct WeatherArgs {
    /// The name of the city to be queried
    pub city_name: String,
}

pub struct WeatherTool {
    client: Client,
    base_url: String,
}

impl WeatherTool {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, city: &str) -> Result<Value, String> {
        let url = city_url(&self.base_url, city)?;
        self.client
            .get(url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }
}

/// `{base}/{city}?format=j1`；城市名作为单个路径段编码
pub fn city_url(base_url: &str, city: &str) -> Result<Url, String> {
    let mut url = Url::parse(base_url).map_err(|e| format!("invalid weather base_url: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("weather base_url cannot take a path: {base_url}"))?
        .pop_if_empty()
        .push(city);
    url.query_pairs_mut().clear().append_pair("format", "j1");
    Ok(url)
}

/// 从 j1 响应中挑出关心的字段
pub fn select_current(resp: &Value) -> Option<Value> {
    let current = resp.get("current_condition")?.get(0)?;
    let mut picked = Map::new();
    for key in CURRENT_KEYS {
        picked.insert((*key).to_string(), current.get(*key)?.clone());
    }
    Some(serde_json::json!({ "current_condition": picked }))
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_weather"
    }

    fn description(&self) -> &str {
        "Get the current weather for `city_name`"
    }

    fn params(&self) -> Vec<ParamSpec> {
        params_from_schema::<WeatherArgs>()
    }

    async fn execute(&self, args: Value) -> Result<ToolCallResult, String> {
        let args: WeatherArgs = parse_args(args)?;
        let city = args.city_name.trim();
        if city.is_empty() {
            return Err("City name must be a non-empty string".to_string());
        }
        tracing::info!(city = %city, "weather tool execute");

        let text = match self.fetch(city).await {
            Ok(resp) => match select_current(&resp) {
                Some(selected) => selected.to_string(),
                None => "Error encountered while fetching weather data!\nunexpected response shape"
                    .to_string(),
            },
            Err(e) => format!("Error encountered while fetching weather data!\n{e}"),
        };
        Ok(ToolCallResult::Text(text))
    }
}
