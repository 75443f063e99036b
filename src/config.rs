//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WXBOT__*` 覆盖（双下划线表示嵌套，如 `WXBOT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::memory::Mode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub conversation: ConversationSection,
    pub orchestrator: OrchestratorSection,
    pub kernel: KernelSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、文件目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 用户上传文件与图片结果的存放目录（代码模式提示词中会告知模型）
    pub file_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "wxbot".to_string(),
            file_path: None,
        }
    }
}

impl AppSection {
    pub fn file_dir(&self) -> PathBuf {
        self.file_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace/files"))
    }
}

/// [llm] 段：后端选择、地址、代理与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：chatglm / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 未设置时读取环境变量 OPENAI_API_KEY
    pub api_key: Option<String>,
    pub proxy: Option<String>,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "chatglm".to_string(),
            model: "chatglm3".to_string(),
            base_url: None,
            api_key: None,
            proxy: None,
            temperature: 1.0,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [conversation] 段：历史长度、置顶前缀、各模式系统提示词
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationSection {
    /// 每个 (peer, mode) 会话保留的最大消息数（含系统消息）
    pub max_messages: usize,
    /// 滚动清除时受保护的前缀长度；未设置时保护该模式的全部系统消息
    pub pinned_prefix: Option<usize>,
    pub prompts: PromptsSection,
}

impl Default for ConversationSection {
    fn default() -> Self {
        Self {
            max_messages: 10,
            pinned_prefix: None,
            prompts: PromptsSection::default(),
        }
    }
}

/// [conversation.prompts] 段：每个模式的系统消息列表，`{file_path}` 会被替换为文件目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    pub chat: Vec<String>,
    pub tool: Vec<String>,
    pub code: Vec<String>,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            chat: vec!["你是一个乐于助人的智能助手。".to_string()],
            tool: vec![
                "Answer the following questions as best as you can. You have access to the following tools:"
                    .to_string(),
            ],
            code: vec![
                "你是一位智能AI助手，你叫ChatGLM，你连接着一台电脑，但请注意不能联网。在使用Python解决任务时，你可以运行代码并得到结果，如果运行结果有错误，你需要尽可能对代码进行改进。你可以处理用户上传到电脑上的文件，文件默认存储路径是{file_path}。"
                    .to_string(),
            ],
        }
    }
}

impl PromptsSection {
    /// 取某模式的系统消息，并替换 `{file_path}` 占位符
    pub fn for_mode(&self, mode: Mode, file_path: &str) -> Vec<String> {
        let raw = match mode {
            Mode::Chat => &self.chat,
            Mode::Tool => &self.tool,
            Mode::Code => &self.code,
        };
        raw.iter()
            .map(|p| p.replace("{file_path}", file_path))
            .collect()
    }
}

/// [orchestrator] 段：每条消息的轮次预算与整轮超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_rounds: usize,
    pub turn_timeout_secs: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            turn_timeout_secs: 300,
        }
    }
}

/// [kernel] 段：代码内核进程
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// 关闭时代码模式不可用（使用已关闭的内核会话）
    pub enabled: bool,
    /// 解释器命令，可带参数，如 "python3" 或 "/opt/conda/bin/python -X utf8"
    pub command: String,
    /// 内核启动后先执行的初始化脚本
    pub init_file: Option<PathBuf>,
    /// 追加到 PATH 并设为 PYTHONPATH
    pub python_path: Option<String>,
    /// 每次轮询的超时（秒）
    pub poll_timeout_secs: u64,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "python3".to_string(),
            init_file: None,
            python_path: None,
            poll_timeout_secs: 40,
        }
    }
}

/// [tools] 段：工具超时与各工具数据源
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub weather: WeatherSection,
    pub news: NewsSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            weather: WeatherSection::default(),
            news: NewsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherSection {
    pub base_url: String,
}

impl Default for WeatherSection {
    fn default() -> Self {
        Self {
            base_url: "https://wttr.in".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NewsSection {
    pub url: String,
}

impl Default for NewsSection {
    fn default() -> Self {
        Self {
            url: "https://www.cls.cn/api/sw?app=CailianpressWeb&os=web&sv=7.7.5".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WXBOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WXBOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("WXBOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
