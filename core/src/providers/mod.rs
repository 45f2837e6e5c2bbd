//! Provider adapters: one implementation per backend API shape, all speaking
//! the same normalised chat contract.
//!
//! The [`AdapterRegistry`] maps a [`ProviderKind`] to the function that builds
//! its adapter, so supporting a new backend means registering one builder
//! rather than adding another branch to every call site.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{AiError, AiResult};

pub mod anthropic;
pub mod catalog;
pub mod custom;
mod http;
pub mod ollama;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use catalog::{provider_info, ProviderInfo, SUPPORTED_PROVIDERS};
pub use custom::CustomEndpointAdapter;
pub use ollama::{OllamaAdapter, PullHandle, PullOutcome, DEFAULT_OLLAMA_URL};
pub use openai::OpenAiAdapter;

/// Closed set of backend API shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    HostedGeneric,
    Ollama,
    Custom,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::HostedGeneric,
        ProviderKind::Ollama,
        ProviderKind::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::HostedGeneric => "hosted_generic",
            Self::Ollama => "ollama",
            Self::Custom => "custom",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama)
    }

    /// Hosted SaaS APIs always need an API key.
    pub fn requires_credential(&self) -> bool {
        matches!(self, Self::OpenAi | Self::Anthropic | Self::HostedGeneric)
    }

    pub fn requires_endpoint(&self) -> bool {
        matches!(self, Self::HostedGeneric | Self::Custom)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase().replace('-', "_");
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalised)
            .ok_or_else(|| AiError::UnsupportedProvider(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionOptions {
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_TOP_P: f32 = 0.9;
    pub const DEFAULT_MAX_TOKENS: u32 = 2048;

    pub fn with_max_tokens(max_tokens: u32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Self::default()
        }
    }
}

/// Normalised completion result every adapter maps into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub tokens_used: Option<u64>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> AiResult<Completion>;

    /// Model management for local runtimes; hosted adapters have none.
    fn model_host(&self) -> Option<&dyn LocalModelHost> {
        None
    }
}

#[async_trait]
pub trait LocalModelHost: Send + Sync {
    async fn list_models(&self) -> AiResult<Vec<String>>;

    /// Start downloading `name` in the background. Must be called from within
    /// a Tokio runtime; the returned handle can be awaited or cancelled.
    fn pull_model(&self, name: &str) -> PullHandle;
}

/// Everything a builder needs to construct one adapter.
pub struct AdapterSpec {
    pub kind: ProviderKind,
    pub credential: Option<SecretString>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub timeout: Duration,
    /// Deadline for the long-running local model download.
    pub pull_timeout: Duration,
    /// Deadline for listing models on a local runtime.
    pub list_timeout: Duration,
}

impl fmt::Debug for AdapterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSpec")
            .field("kind", &self.kind)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl AdapterSpec {
    pub fn new(kind: ProviderKind, timeout: Duration) -> Self {
        Self {
            kind,
            credential: None,
            model: None,
            endpoint: None,
            timeout,
            pull_timeout: Duration::from_secs(300),
            list_timeout: Duration::from_secs(10),
        }
    }

    pub fn credential(mut self, credential: Option<SecretString>) -> Self {
        self.credential = credential;
        self
    }

    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint.filter(|e| !e.trim().is_empty());
        self
    }

    fn model_or_default(&self) -> AiResult<String> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }
        catalog::provider_info(self.kind)
            .default_model
            .map(str::to_string)
            .ok_or_else(|| {
                AiError::InvalidConfig(format!("a model name is required for {}", self.kind))
            })
    }

    fn required_endpoint(&self) -> AiResult<String> {
        self.endpoint
            .clone()
            .ok_or_else(|| AiError::InvalidConfig(format!("{} needs an endpoint URL", self.kind)))
    }

    fn required_credential(&mut self) -> AiResult<SecretString> {
        self.credential
            .take()
            .ok_or_else(|| AiError::InvalidConfig(format!("{} needs an API key", self.kind)))
    }
}

pub type AdapterBuilder = fn(&Client, AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>>;

/// Lookup table from provider kind to adapter constructor.
#[derive(Clone)]
pub struct AdapterRegistry {
    builders: HashMap<ProviderKind, AdapterBuilder>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with every built-in adapter.
    pub fn standard() -> Self {
        Self::empty()
            .with(ProviderKind::OpenAi, OpenAiAdapter::build)
            .with(ProviderKind::HostedGeneric, OpenAiAdapter::build)
            .with(ProviderKind::Anthropic, AnthropicAdapter::build)
            .with(ProviderKind::Ollama, OllamaAdapter::build)
            .with(ProviderKind::Custom, CustomEndpointAdapter::build)
    }

    pub fn with(mut self, kind: ProviderKind, builder: AdapterBuilder) -> Self {
        self.builders.insert(kind, builder);
        self
    }

    pub fn supports(&self, kind: ProviderKind) -> bool {
        self.builders.contains_key(&kind)
    }

    pub fn build(&self, client: &Client, spec: AdapterSpec) -> AiResult<Arc<dyn ProviderAdapter>> {
        let builder = self
            .builders
            .get(&spec.kind)
            .ok_or_else(|| AiError::UnsupportedProvider(spec.kind.to_string()))?;
        builder(client, spec)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Collapse arbitrary role strings into the three roles every backend knows.
pub(crate) fn normalise_role(role: &str) -> &'static str {
    match role.to_lowercase().as_str() {
        "system" => "system",
        "assistant" => "assistant",
        _ => "user",
    }
}

pub(crate) fn normalise_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": normalise_role(&m.role),
                "content": m.content,
            })
        })
        .collect()
}
