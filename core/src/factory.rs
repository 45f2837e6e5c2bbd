use std::sync::Arc;

use reqwest::Client;
use secrecy::ExposeSecret;

use crate::config::TimeoutConfig;
use crate::errors::{AiError, AiResult};
use crate::providers::{AdapterRegistry, AdapterSpec, OllamaAdapter, ProviderAdapter, ProviderKind};
use crate::registry::{ConfigRegistry, ResolvedConfig};

/// Shared HTTP client for every adapter; deadlines are applied per request.
pub fn build_http_client(user_agent: &str) -> AiResult<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .map_err(|err| AiError::InvalidConfig(format!("failed to construct HTTP client: {err}")))
}

/// Hands out a ready adapter for an owner's default configuration.
#[derive(Clone)]
pub struct ClientFactory {
    registry: ConfigRegistry,
    adapters: AdapterRegistry,
    client: Client,
    timeouts: TimeoutConfig,
}

impl ClientFactory {
    pub fn new(
        registry: ConfigRegistry,
        adapters: AdapterRegistry,
        client: Client,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            registry,
            adapters,
            client,
            timeouts,
        }
    }

    pub fn registry(&self) -> &ConfigRegistry {
        &self.registry
    }

    /// Blocking: reads SQLite and decrypts the credential.
    pub fn client_for_owner(&self, owner: &str) -> AiResult<Arc<dyn ProviderAdapter>> {
        let resolved = self
            .registry
            .get_default_active_config(owner)?
            .ok_or(AiError::NoConfiguration)?;
        let adapter = self.client_for(resolved)?;
        log::debug!(
            target: "ai.factory",
            "resolved {} adapter with model {} for {owner}",
            adapter.kind(),
            adapter.model()
        );
        Ok(adapter)
    }

    pub fn client_for(&self, resolved: ResolvedConfig) -> AiResult<Arc<dyn ProviderAdapter>> {
        let kind = resolved.kind()?;
        let credential = Some(resolved.credential).filter(|c| !c.expose_secret().trim().is_empty());
        let spec = self
            .spec_for(kind)
            .credential(credential)
            .model(resolved.model_name)
            .endpoint(resolved.endpoint_override);
        self.adapters.build(&self.client, spec)
    }

    /// Adapter for model management on a local runtime, independent of any
    /// saved configuration.
    pub fn local_host(&self, endpoint: Option<&str>) -> AiResult<OllamaAdapter> {
        let spec = self
            .spec_for(ProviderKind::Ollama)
            .endpoint(endpoint.map(str::to_string));
        OllamaAdapter::from_spec(&self.client, spec)
    }

    fn spec_for(&self, kind: ProviderKind) -> AdapterSpec {
        let timeout = match kind {
            ProviderKind::Ollama | ProviderKind::Custom => self.timeouts.local(),
            _ => self.timeouts.hosted(),
        };
        let mut spec = AdapterSpec::new(kind, timeout);
        spec.pull_timeout = self.timeouts.pull();
        spec.list_timeout = self.timeouts.list_models();
        spec
    }
}
