//! High level facade the surrounding application holds on to.
//!
//! The manager owns the SQLite pool, the client factory, the connection
//! tester and the usage meter. SQLite work runs on the blocking pool so the
//! async methods can be called straight from request handlers; provider calls
//! stay on the async runtime and never hold a database connection.

use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::config::CoreConfig;
use crate::db::{self, DbPool};
use crate::errors::{AiError, AiResult};
use crate::factory::{build_http_client, ClientFactory};
use crate::logging::{log_event, spawn_event};
use crate::providers::{
    AdapterRegistry, ChatMessage, Completion, CompletionOptions, LocalModelHost, ProviderAdapter,
    ProviderInfo, ProviderKind, PullHandle, SUPPORTED_PROVIDERS,
};
use crate::registry::{ConfigRegistry, ConfigSummary, ConfigUpdate, NewProviderConfig};
use crate::secrets::{CredentialCipher, KeyProvider};
use crate::tester::{ConnectionReport, ConnectionTester};
use crate::usage::{UsageEntry, UsageMeter, UsageRecord, UsageStats};

const FINGERPRINT_SETTING: &str = "crypto.key_fingerprint";

/// A completion on behalf of an owner, with optional case context that is
/// folded into the system instructions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediationRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub case_type: Option<String>,
    pub sender_role: Option<String>,
    #[serde(default)]
    pub options: CompletionOptions,
}

impl MediationRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    fn into_messages(self) -> Vec<ChatMessage> {
        let mut instructions = Vec::new();
        if let Some(prompt) = self.system_prompt.filter(|p| !p.trim().is_empty()) {
            instructions.push(prompt);
        }
        if let Some(case_type) = self.case_type.filter(|c| !c.trim().is_empty()) {
            instructions.push(format!("Case type: {case_type}"));
        }
        if let Some(role) = self.sender_role.filter(|r| !r.trim().is_empty()) {
            instructions.push(format!("The message was written by the {role}."));
        }
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if !instructions.is_empty() {
            messages.push(ChatMessage::system(instructions.join("\n")));
        }
        messages.extend(self.messages);
        messages
    }
}

#[derive(Clone)]
pub struct ModelManager {
    pool: DbPool,
    factory: ClientFactory,
    tester: ConnectionTester,
    meter: UsageMeter,
    key_fingerprint: String,
}

impl ModelManager {
    /// Load (or create) the key file, open the database and wire everything
    /// together with the standard adapters.
    pub fn init(config: CoreConfig) -> anyhow::Result<Arc<Self>> {
        let key = KeyProvider::load_or_generate(&config.key_path())
            .with_context(|| format!("failed to load key file {}", config.key_path().display()))?;
        let pool = db::init_db(&config.database_path())?;
        let manager = Self::with_parts(pool, &key, &config, AdapterRegistry::standard())?;
        manager.check_key_fingerprint()?;
        log::info!(
            target: "ai.manager",
            "model manager ready (workspace {}, key {})",
            config.workspace_dir.display(),
            manager.key_fingerprint
        );
        Ok(manager)
    }

    pub fn with_parts(
        pool: DbPool,
        key: &KeyProvider,
        config: &CoreConfig,
        adapters: AdapterRegistry,
    ) -> AiResult<Arc<Self>> {
        let client = build_http_client(&config.user_agent)?;
        let cipher = CredentialCipher::new(key);
        let registry =
            ConfigRegistry::new(pool.clone(), cipher).with_owner_limit(config.max_configs_per_owner);
        let factory = ClientFactory::new(
            registry,
            adapters.clone(),
            client.clone(),
            config.timeouts.clone(),
        );
        let tester = ConnectionTester::new(client, adapters, config.timeouts.clone());
        Ok(Arc::new(Self {
            meter: UsageMeter::new(pool.clone()),
            pool,
            factory,
            tester,
            key_fingerprint: key.fingerprint(),
        }))
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    /// Compare the loaded key with the one recorded at first start. A
    /// mismatch is reported but not fatal: existing credentials simply fail
    /// to decrypt until the original key file is restored.
    pub fn check_key_fingerprint(&self) -> AiResult<bool> {
        let conn = self.pool.get()?;
        let recorded = db::read_setting(&conn, FINGERPRINT_SETTING)?;
        match recorded {
            None => {
                db::write_setting(&conn, FINGERPRINT_SETTING, &self.key_fingerprint)?;
                Ok(true)
            }
            Some(recorded) if recorded == self.key_fingerprint => Ok(true),
            Some(recorded) => {
                let configs = self.factory.registry().count_configs()?;
                if configs == 0 {
                    db::write_setting(&conn, FINGERPRINT_SETTING, &self.key_fingerprint)?;
                    return Ok(true);
                }
                log_event(
                    &conn,
                    "error",
                    Some("SEC-0101"),
                    "ai.manager",
                    "encryption key differs from the one that sealed stored credentials",
                    Some("Restore the original key file or re-enter the API keys."),
                    Some(serde_json::json!({
                        "recorded": recorded,
                        "loaded": self.key_fingerprint,
                        "configs": configs,
                    })),
                )?;
                Ok(false)
            }
        }
    }

    pub fn supported_providers(&self) -> &'static [ProviderInfo] {
        SUPPORTED_PROVIDERS
    }

    pub async fn save_config(&self, new: NewProviderConfig) -> AiResult<String> {
        let registry = self.factory.registry().clone();
        run_blocking(move || registry.save_config(new)).await
    }

    pub async fn list_configs(&self, owner: &str) -> AiResult<Vec<ConfigSummary>> {
        let registry = self.factory.registry().clone();
        let owner = owner.to_string();
        run_blocking(move || registry.list_configs(&owner)).await
    }

    pub async fn update_config(&self, config_id: &str, update: ConfigUpdate) -> AiResult<ConfigSummary> {
        let registry = self.factory.registry().clone();
        let config_id = config_id.to_string();
        run_blocking(move || registry.update_config(&config_id, update)).await
    }

    pub async fn set_default(&self, config_id: &str) -> AiResult<ConfigSummary> {
        let registry = self.factory.registry().clone();
        let config_id = config_id.to_string();
        run_blocking(move || registry.set_default(&config_id)).await
    }

    pub async fn deactivate_config(&self, config_id: &str) -> AiResult<ConfigSummary> {
        let registry = self.factory.registry().clone();
        let config_id = config_id.to_string();
        run_blocking(move || registry.deactivate_config(&config_id)).await
    }

    pub async fn activate_config(&self, config_id: &str) -> AiResult<ConfigSummary> {
        let registry = self.factory.registry().clone();
        let config_id = config_id.to_string();
        run_blocking(move || registry.activate_config(&config_id)).await
    }

    pub async fn delete_config(&self, config_id: &str) -> AiResult<()> {
        let registry = self.factory.registry().clone();
        let config_id = config_id.to_string();
        run_blocking(move || registry.delete_config(&config_id)).await
    }

    pub async fn get_client_for_owner(&self, owner: &str) -> AiResult<Arc<dyn ProviderAdapter>> {
        let factory = self.factory.clone();
        let owner = owner.to_string();
        run_blocking(move || factory.client_for_owner(&owner)).await
    }

    pub async fn test_connection(
        &self,
        kind: ProviderKind,
        credential: &str,
        model: Option<&str>,
        endpoint: Option<&str>,
    ) -> ConnectionReport {
        self.tester.test(kind, credential, model, endpoint).await
    }

    /// Re-test a stored configuration with its decrypted credential.
    pub async fn test_saved_config(&self, config_id: &str) -> AiResult<ConnectionReport> {
        let registry = self.factory.registry().clone();
        let id = config_id.to_string();
        let resolved = run_blocking(move || registry.resolve_config(&id)).await?;
        let kind = resolved.kind()?;
        let report = self
            .tester
            .test(
                kind,
                resolved.credential.expose_secret(),
                resolved.model_name.as_deref(),
                resolved.endpoint_override.as_deref(),
            )
            .await;
        spawn_event(
            &self.pool,
            if report.ok { "info" } else { "warn" },
            "AI-0110",
            "ai.tester",
            "saved configuration tested".into(),
            serde_json::json!({ "config_id": config_id, "ok": report.ok }),
        );
        Ok(report)
    }

    pub async fn log_usage(&self, entry: UsageEntry) -> AiResult<String> {
        let meter = self.meter.clone();
        run_blocking(move || meter.log_usage(&entry)).await
    }

    pub async fn get_usage_stats(&self, owner: &str, window_days: u32) -> AiResult<UsageStats> {
        let meter = self.meter.clone();
        let owner = owner.to_string();
        run_blocking(move || meter.get_usage_stats(&owner, window_days)).await
    }

    pub async fn recent_usage(&self, owner: &str, limit: usize) -> AiResult<Vec<UsageRecord>> {
        let meter = self.meter.clone();
        let owner = owner.to_string();
        run_blocking(move || meter.recent_usage(&owner, limit)).await
    }

    /// Complete with the owner's default provider and meter the call. A usage
    /// write failure is logged; the completion is still returned.
    pub async fn complete_for_owner(
        &self,
        owner: &str,
        request: MediationRequest,
    ) -> AiResult<Completion> {
        let adapter = self.get_client_for_owner(owner).await?;
        let options = request.options.clone();
        let messages = request.into_messages();
        let kind = adapter.kind();
        let model = adapter.model().to_string();

        let completion = match adapter.complete(&messages, &options).await {
            Ok(completion) => completion,
            Err(err) => {
                spawn_event(
                    &self.pool,
                    "warn",
                    err.code(),
                    "ai.runtime",
                    format!("{kind} completion failed: {err}"),
                    serde_json::json!({ "owner_id": owner, "provider": kind.as_str(), "model": model }),
                );
                return Err(err);
            }
        };

        let entry = UsageEntry::chat(owner, kind.as_str(), Some(&model), completion.tokens_used.unwrap_or(0));
        if let Err(err) = self.log_usage(entry).await {
            log::error!(target: "ai.usage", "failed to record usage for {owner}: {err}");
            spawn_event(
                &self.pool,
                "error",
                err.code(),
                "ai.usage",
                format!("usage could not be recorded: {err}"),
                serde_json::json!({ "owner_id": owner, "provider": kind.as_str() }),
            );
        }
        Ok(completion)
    }

    pub async fn list_local_models(&self, endpoint: Option<&str>) -> AiResult<Vec<String>> {
        let host = self.factory.local_host(endpoint)?;
        host.list_models().await
    }

    /// Start a background model download. Must be called inside a Tokio
    /// runtime.
    pub fn pull_local_model(&self, endpoint: Option<&str>, name: &str) -> AiResult<PullHandle> {
        if name.trim().is_empty() {
            return Err(AiError::InvalidRequest("model name must not be empty".into()));
        }
        let host = self.factory.local_host(endpoint)?;
        Ok(host.pull_model(name.trim()))
    }
}

async fn run_blocking<T, F>(job: F) -> AiResult<T>
where
    F: FnOnce() -> AiResult<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(job).await?
}
