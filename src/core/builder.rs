//! 编排器构建器：按配置组装模型后端、工具、代码内核、会话存储与投递端

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, Orchestrator, RegistryError, SessionSupervisor};
use crate::delivery::{ConsoleSender, FileImageStore, ImageStore, MessageSender};
use crate::kernel::{KernelSession, KernelTransport, ProcessKernel, ProcessKernelConfig};
use crate::llm::{ChatGlmClient, ChatGlmOptions, MockLlmClient, ModelBackend, OpenAiClient};
use crate::memory::{ConversationStore, Mode};
use crate::tools::{ClockTool, NewsTool, ToolExecutor, ToolRegistry, WeatherTool};

pub struct OrchestratorBuilder {
    config: AppConfig,
    backend: Option<Arc<dyn ModelBackend>>,
    transport: Option<Arc<dyn KernelTransport>>,
    sender: Option<Arc<dyn MessageSender>>,
    images: Option<Arc<dyn ImageStore>>,
    cancel_token: Option<CancellationToken>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            backend: None,
            transport: None,
            sender: None,
            images: None,
            cancel_token: None,
        }
    }

    /// 指定模型后端（否则按 [llm] 配置创建）
    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// 指定内核传输（否则按 [kernel] 配置启动子进程）
    pub fn with_kernel_transport(mut self, transport: Arc<dyn KernelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_image_store(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    /// 回合取消令牌挂在此 token 之下（通常是关闭管理器的 token）
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 内置工具注册表；元数据不合法时直接失败
    pub fn build_tool_registry(&self) -> Result<ToolRegistry, RegistryError> {
        let tools_cfg = &self.config.tools;
        let mut tools = ToolRegistry::new();
        tools.register(WeatherTool::new(
            tools_cfg.weather.base_url.clone(),
            tools_cfg.tool_timeout_secs,
        ))?;
        tools.register(ClockTool)?;
        tools.register(NewsTool::new(
            tools_cfg.news.url.clone(),
            tools_cfg.tool_timeout_secs,
        ))?;
        Ok(tools)
    }

    /// 按 provider 创建模型后端；配置不完整时退回 Mock
    pub fn build_llm(&self) -> Arc<dyn ModelBackend> {
        if let Some(backend) = &self.backend {
            return backend.clone();
        }
        let llm = &self.config.llm;
        let provider = llm.provider.to_lowercase();
        if provider == "mock" {
            tracing::info!("Using Mock LLM");
            return Arc::new(MockLlmClient::new());
        }
        if !value_check(&self.config) {
            tracing::warn!(provider = %provider, "LLM not fully configured, using Mock LLM");
            return Arc::new(MockLlmClient::new());
        }
        match provider.as_str() {
            "chatglm" => {
                let options = ChatGlmOptions {
                    base_url: llm.base_url.clone().unwrap_or_default(),
                    model: llm.model.clone(),
                    api_key: llm.api_key.clone(),
                    proxy: llm.proxy.clone(),
                    temperature: llm.temperature,
                    request_timeout_secs: llm.timeouts.request,
                };
                match ChatGlmClient::new(options) {
                    Ok(client) => {
                        tracing::info!(model = %llm.model, "Using ChatGLM LLM");
                        Arc::new(client)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ChatGLM client init failed, using Mock LLM");
                        Arc::new(MockLlmClient::new())
                    }
                }
            }
            "openai" => {
                tracing::info!(model = %llm.model, "Using OpenAI LLM");
                Arc::new(OpenAiClient::new(
                    llm.base_url.as_deref(),
                    &llm.model,
                    llm.api_key.as_deref(),
                    llm.temperature,
                ))
            }
            other => {
                tracing::warn!(provider = %other, "Unknown LLM provider, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        }
    }

    /// 启动代码内核；禁用或启动失败时返回已关闭的会话（代码模式执行会报错，其它模式不受影响）
    pub async fn build_kernel(&self) -> Arc<KernelSession> {
        let kernel_cfg = &self.config.kernel;
        let poll_timeout = Duration::from_secs(kernel_cfg.poll_timeout_secs);
        if let Some(transport) = &self.transport {
            return Arc::new(KernelSession::new(transport.clone(), poll_timeout));
        }
        if !kernel_cfg.enabled {
            tracing::info!("Code kernel disabled");
            return Arc::new(KernelSession::closed());
        }
        let config = ProcessKernelConfig {
            command: kernel_cfg.command.clone(),
            init_file: kernel_cfg.init_file.clone(),
            python_path: kernel_cfg.python_path.clone(),
        };
        match ProcessKernel::spawn(config).await {
            Ok(kernel) => {
                let session = KernelSession::new(Arc::new(kernel), poll_timeout);
                match session.kernel_info().await {
                    Ok(info) => tracing::info!(
                        implementation = %info.get("implementation").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        "Code kernel ready"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Code kernel health check failed"),
                }
                Arc::new(session)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Code kernel unavailable");
                Arc::new(KernelSession::closed())
            }
        }
    }

    /// 各模式的置顶系统消息与滚动窗口
    pub fn build_store(&self) -> ConversationStore {
        let file_path = self.config.app.file_dir().display().to_string();
        let prompts = &self.config.conversation.prompts;
        let system: HashMap<Mode, Vec<String>> = Mode::ALL
            .iter()
            .map(|mode| (*mode, prompts.for_mode(*mode, &file_path)))
            .collect();
        let store = ConversationStore::new(self.config.conversation.max_messages, system);
        match self.config.conversation.pinned_prefix {
            Some(pinned) => store.with_pinned_prefix(pinned),
            None => store,
        }
    }

    pub async fn build(self) -> Result<Orchestrator, AgentError> {
        if self.config.conversation.max_messages < 2 {
            return Err(AgentError::Config(
                "conversation.max_messages must be at least 2".to_string(),
            ));
        }
        if self.config.orchestrator.turn_timeout_secs <= self.config.kernel.poll_timeout_secs {
            return Err(AgentError::Config(format!(
                "orchestrator.turn_timeout_secs ({}) must exceed kernel.poll_timeout_secs ({})",
                self.config.orchestrator.turn_timeout_secs, self.config.kernel.poll_timeout_secs
            )));
        }
        let registry = self.build_tool_registry()?;
        tracing::info!(tools = ?registry.tool_names(), "Tool registry ready");
        let tools = ToolExecutor::new(registry, self.config.tools.tool_timeout_secs);
        let backend = self.build_llm();
        let kernel = self.build_kernel().await;
        let store = self.build_store();

        let sender = self
            .sender
            .clone()
            .unwrap_or_else(|| Arc::new(ConsoleSender));
        let images = self
            .images
            .clone()
            .unwrap_or_else(|| Arc::new(FileImageStore::new(self.config.app.file_dir())));

        let turn_timeout = Duration::from_secs(self.config.orchestrator.turn_timeout_secs);
        let supervisor = match &self.cancel_token {
            Some(token) => SessionSupervisor::with_token(token.clone(), turn_timeout),
            None => SessionSupervisor::new(turn_timeout),
        };

        Ok(
            Orchestrator::new(backend, tools, kernel, store, sender, images)
                .with_max_rounds(self.config.orchestrator.max_rounds)
                .with_supervisor(supervisor),
        )
    }
}

/// 后端所需配置是否齐全
pub fn value_check(config: &AppConfig) -> bool {
    let llm = &config.llm;
    match llm.provider.to_lowercase().as_str() {
        "chatglm" => {
            llm.base_url.as_deref().is_some_and(|u| !u.is_empty())
                && !llm.model.is_empty()
                && !config.conversation.prompts.chat.is_empty()
                && config.app.file_path.is_some()
        }
        "openai" => !llm.model.is_empty(),
        "mock" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MockKernel;
    use crate::memory::Message;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.llm.provider = "mock".to_string();
        config.kernel.enabled = false;
        config
    }

    #[test]
    fn test_value_check() {
        let mut config = AppConfig::default();
        assert!(!value_check(&config));
        config.llm.base_url = Some("http://localhost:8000/v1".to_string());
        assert!(!value_check(&config));
        config.app.file_path = Some("/tmp/files".into());
        assert!(value_check(&config));
    }

    #[test]
    fn test_tool_registry() {
        let registry = OrchestratorBuilder::new(config()).build_tool_registry().unwrap();
        let mut names = registry.tool_names();
        names.sort();
        assert_eq!(names, vec!["get_news", "get_time", "get_weather"]);
    }

    #[test]
    fn test_unconfigured_backend_falls_back_to_mock() {
        let builder = OrchestratorBuilder::new(AppConfig::default());
        assert_eq!(builder.build_llm().name(), "mock");
    }

    #[test]
    fn test_store_injects_file_path() {
        let mut config = config();
        config.app.file_path = Some("/data/uploads".into());
        let store = OrchestratorBuilder::new(config).build_store();
        store.append("p", Mode::Code, Message::user("hi"));
        let view = store.view("p", Mode::Code);
        assert!(view[0].content.contains("/data/uploads"));
    }

    #[tokio::test]
    async fn test_build_with_disabled_kernel() {
        let orchestrator = OrchestratorBuilder::new(config()).build().await.unwrap();
        assert!(!orchestrator.kernel().is_alive().await);
        assert_eq!(orchestrator.tool_specs().len(), 3);
    }

    #[tokio::test]
    async fn test_build_with_mock_kernel() {
        let orchestrator = OrchestratorBuilder::new(config())
            .with_kernel_transport(Arc::new(MockKernel::new()))
            .build()
            .await
            .unwrap();
        assert!(orchestrator.kernel().is_alive().await);
    }

    #[tokio::test]
    async fn test_rejects_tiny_window() {
        let mut config = config();
        config.conversation.max_messages = 1;
        assert!(OrchestratorBuilder::new(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_turn_deadline_within_kernel_poll() {
        let mut config = config();
        config.orchestrator.turn_timeout_secs = 40;
        config.kernel.poll_timeout_secs = 40;
        let err = OrchestratorBuilder::new(config).build().await.err().unwrap();
        assert!(matches!(err, AgentError::Config(msg) if msg.contains("turn_timeout_secs")));
    }
}
