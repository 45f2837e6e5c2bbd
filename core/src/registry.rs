//! Durable per-owner provider configurations.
//!
//! Credentials are sealed with [`CredentialCipher`] before they reach SQLite
//! and only come back out through [`ConfigRegistry::get_default_active_config`].
//! Every write that can touch `is_default` runs inside an immediate
//! transaction, so concurrent saves for one owner can never leave zero or two
//! defaults behind.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use reqwest::Url;
use secrecy::SecretString;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;
use crate::errors::{AiError, AiResult};
use crate::logging::log_event;
use crate::providers::{ProviderKind, DEFAULT_OLLAMA_URL};
use crate::secrets::CredentialCipher;

/// Listing view of a configuration. Never carries the credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub config_id: String,
    pub owner_id: String,
    /// Stored provider identifier; see [`ConfigSummary::kind`].
    pub provider: String,
    pub model_name: Option<String>,
    pub endpoint_override: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConfigSummary {
    pub fn kind(&self) -> AiResult<ProviderKind> {
        self.provider.parse()
    }
}

/// The owner's usable default with its credential decrypted.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub config_id: String,
    pub owner_id: String,
    pub provider: String,
    pub credential: SecretString,
    pub model_name: Option<String>,
    pub endpoint_override: Option<String>,
}

impl ResolvedConfig {
    pub fn kind(&self) -> AiResult<ProviderKind> {
        self.provider.parse()
    }
}

#[derive(Debug, Clone)]
pub struct NewProviderConfig {
    pub owner_id: String,
    pub provider_kind: ProviderKind,
    pub credential: String,
    pub model_name: Option<String>,
    pub endpoint_override: Option<String>,
    pub make_default: bool,
}

/// Partial update; `None` leaves a field untouched. The nested options on
/// model and endpoint allow clearing them with `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub credential: Option<String>,
    pub model_name: Option<Option<String>>,
    pub endpoint_override: Option<Option<String>>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
}

#[derive(Clone)]
pub struct ConfigRegistry {
    pool: DbPool,
    cipher: CredentialCipher,
    max_per_owner: Option<usize>,
}

impl ConfigRegistry {
    pub fn new(pool: DbPool, cipher: CredentialCipher) -> Self {
        Self {
            pool,
            cipher,
            max_per_owner: None,
        }
    }

    pub fn with_owner_limit(mut self, limit: Option<usize>) -> Self {
        self.max_per_owner = limit;
        self
    }

    pub fn save_config(&self, new: NewProviderConfig) -> AiResult<String> {
        let owner = new.owner_id.as_str();
        if owner.trim().is_empty() {
            return Err(AiError::InvalidConfig("owner id must not be empty".into()));
        }
        let endpoint =
            validate_provider_fields(new.provider_kind, &new.credential, new.endpoint_override.as_deref())?;
        let sealed = self.cipher.encrypt(new.credential.trim())?;
        let model = clean(new.model_name);
        let config_id = Uuid::new_v4().to_string();
        let now = now();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(limit) = self.max_per_owner {
            let existing: i64 = tx.query_row(
                "SELECT COUNT(1) FROM ai_provider_configs WHERE owner_id = ?1",
                params![owner],
                |row| row.get(0),
            )?;
            if existing as usize >= limit {
                return Err(AiError::ConfigLimitReached(limit));
            }
        }
        if new.make_default {
            demote_defaults(&tx, owner, now)?;
        }
        tx.execute(
            "INSERT INTO ai_provider_configs
                (config_id, owner_id, provider, credential_encrypted, model_name, endpoint_override,
                 is_active, is_default, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
            params![
                config_id,
                owner,
                new.provider_kind.as_str(),
                sealed,
                model,
                endpoint,
                new.make_default,
                now,
            ],
        )?;
        tx.commit()?;

        audit(
            &conn,
            "AI-0101",
            "provider configuration saved",
            json!({
                "config_id": config_id,
                "owner_id": owner,
                "provider": new.provider_kind.as_str(),
                "model": model,
                "is_default": new.make_default,
            }),
        );
        Ok(config_id)
    }

    /// Default first, then newest first.
    pub fn list_configs(&self, owner: &str) -> AiResult<Vec<ConfigSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT config_id, owner_id, provider, model_name, endpoint_override, is_active, is_default, created_at, updated_at
             FROM ai_provider_configs
             WHERE owner_id = ?1
             ORDER BY is_default DESC, created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map(params![owner], map_summary)?;
        let mut configs = Vec::new();
        for row in rows {
            configs.push(row?);
        }
        Ok(configs)
    }

    pub fn get_config(&self, config_id: &str) -> AiResult<ConfigSummary> {
        let conn = self.pool.get()?;
        fetch_summary(&conn, config_id)
    }

    /// Only a row that is both default and active qualifies. A credential
    /// that fails to decrypt is an error, not an absent config.
    pub fn get_default_active_config(&self, owner: &str) -> AiResult<Option<ResolvedConfig>> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT config_id, owner_id, provider, credential_encrypted, model_name, endpoint_override
                 FROM ai_provider_configs
                 WHERE owner_id = ?1 AND is_default = 1 AND is_active = 1
                 LIMIT 1",
                params![owner],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((config_id, owner_id, provider, sealed, model_name, endpoint_override)) = row else {
            return Ok(None);
        };
        let credential = self.cipher.decrypt(&sealed).map_err(|err| {
            audit_failure(&conn, &config_id, &err);
            err
        })?;
        Ok(Some(ResolvedConfig {
            config_id,
            owner_id,
            provider,
            credential: SecretString::from(credential),
            model_name,
            endpoint_override,
        }))
    }

    /// Decrypt any stored credential by id, for re-testing a saved config.
    pub fn resolve_config(&self, config_id: &str) -> AiResult<ResolvedConfig> {
        let conn = self.pool.get()?;
        let summary = fetch_summary(&conn, config_id)?;
        let sealed: String = conn.query_row(
            "SELECT credential_encrypted FROM ai_provider_configs WHERE config_id = ?1",
            params![config_id],
            |row| row.get(0),
        )?;
        let credential = self.cipher.decrypt(&sealed).map_err(|err| {
            audit_failure(&conn, config_id, &err);
            err
        })?;
        Ok(ResolvedConfig {
            config_id: summary.config_id,
            owner_id: summary.owner_id,
            provider: summary.provider,
            credential: SecretString::from(credential),
            model_name: summary.model_name,
            endpoint_override: summary.endpoint_override,
        })
    }

    pub fn update_config(&self, config_id: &str, update: ConfigUpdate) -> AiResult<ConfigSummary> {
        let now = now();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch_summary(&tx, config_id)?;

        if let Some(credential) = &update.credential {
            let kind = current.kind()?;
            validate_provider_fields(kind, credential, current.endpoint_override.as_deref())?;
            let sealed = self.cipher.encrypt(credential.trim())?;
            tx.execute(
                "UPDATE ai_provider_configs SET credential_encrypted = ?1 WHERE config_id = ?2",
                params![sealed, config_id],
            )?;
        }
        if let Some(model) = update.model_name.clone() {
            tx.execute(
                "UPDATE ai_provider_configs SET model_name = ?1 WHERE config_id = ?2",
                params![clean(model), config_id],
            )?;
        }
        if let Some(endpoint) = update.endpoint_override.clone() {
            let kind = current.kind()?;
            let endpoint = validate_endpoint(kind, endpoint.as_deref())?;
            tx.execute(
                "UPDATE ai_provider_configs SET endpoint_override = ?1 WHERE config_id = ?2",
                params![endpoint, config_id],
            )?;
        }
        if let Some(active) = update.is_active {
            tx.execute(
                "UPDATE ai_provider_configs SET is_active = ?1 WHERE config_id = ?2",
                params![active, config_id],
            )?;
        }
        match update.is_default {
            Some(true) => {
                demote_defaults(&tx, &current.owner_id, now)?;
                tx.execute(
                    "UPDATE ai_provider_configs SET is_default = 1 WHERE config_id = ?1",
                    params![config_id],
                )?;
            }
            Some(false) => {
                tx.execute(
                    "UPDATE ai_provider_configs SET is_default = 0 WHERE config_id = ?1",
                    params![config_id],
                )?;
            }
            None => {}
        }
        tx.execute(
            "UPDATE ai_provider_configs SET updated_at = ?1 WHERE config_id = ?2",
            params![now, config_id],
        )?;
        let updated = fetch_summary(&tx, config_id)?;
        tx.commit()?;

        audit(
            &conn,
            "AI-0102",
            "provider configuration updated",
            json!({
                "config_id": config_id,
                "owner_id": updated.owner_id,
                "credential_rotated": update.credential.is_some(),
                "is_active": updated.is_active,
                "is_default": updated.is_default,
            }),
        );
        Ok(updated)
    }

    pub fn set_default(&self, config_id: &str) -> AiResult<ConfigSummary> {
        self.update_config(
            config_id,
            ConfigUpdate {
                is_default: Some(true),
                ..ConfigUpdate::default()
            },
        )
    }

    pub fn deactivate_config(&self, config_id: &str) -> AiResult<ConfigSummary> {
        self.update_config(
            config_id,
            ConfigUpdate {
                is_active: Some(false),
                ..ConfigUpdate::default()
            },
        )
    }

    pub fn activate_config(&self, config_id: &str) -> AiResult<ConfigSummary> {
        self.update_config(
            config_id,
            ConfigUpdate {
                is_active: Some(true),
                ..ConfigUpdate::default()
            },
        )
    }

    /// Usage rows for the config's owner are kept.
    pub fn delete_config(&self, config_id: &str) -> AiResult<()> {
        let conn = self.pool.get()?;
        let removed = conn.execute(
            "DELETE FROM ai_provider_configs WHERE config_id = ?1",
            params![config_id],
        )?;
        if removed == 0 {
            return Err(AiError::ConfigNotFound);
        }
        audit(
            &conn,
            "AI-0103",
            "provider configuration deleted",
            json!({ "config_id": config_id }),
        );
        Ok(())
    }

    pub fn count_configs(&self) -> AiResult<i64> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(1) FROM ai_provider_configs", [], |row| row.get(0))?)
    }
}

/// Checks shared by saving and connection testing. Returns the endpoint to
/// store, filling in the local default for Ollama.
pub fn validate_provider_fields(
    kind: ProviderKind,
    credential: &str,
    endpoint: Option<&str>,
) -> AiResult<Option<String>> {
    if kind.requires_credential() && credential.trim().is_empty() {
        return Err(AiError::InvalidConfig(format!("{kind} requires an API key")));
    }
    validate_endpoint(kind, endpoint)
}

fn validate_endpoint(kind: ProviderKind, endpoint: Option<&str>) -> AiResult<Option<String>> {
    let endpoint = endpoint.map(str::trim).filter(|e| !e.is_empty());
    match endpoint {
        Some(raw) => {
            let url = Url::parse(raw)
                .map_err(|err| AiError::InvalidConfig(format!("invalid endpoint {raw}: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AiError::InvalidConfig(format!(
                    "endpoint {raw} must use http or https"
                )));
            }
            Ok(Some(raw.trim_end_matches('/').to_string()))
        }
        None if kind == ProviderKind::Ollama => Ok(Some(DEFAULT_OLLAMA_URL.to_string())),
        None if kind.requires_endpoint() => {
            Err(AiError::InvalidConfig(format!("{kind} requires an endpoint URL")))
        }
        None => Ok(None),
    }
}

fn demote_defaults(conn: &Connection, owner: &str, now: i64) -> AiResult<()> {
    conn.execute(
        "UPDATE ai_provider_configs SET is_default = 0, updated_at = ?2
         WHERE owner_id = ?1 AND is_default = 1",
        params![owner, now],
    )?;
    Ok(())
}

fn fetch_summary(conn: &Connection, config_id: &str) -> AiResult<ConfigSummary> {
    conn.query_row(
        "SELECT config_id, owner_id, provider, model_name, endpoint_override, is_active, is_default, created_at, updated_at
         FROM ai_provider_configs WHERE config_id = ?1",
        params![config_id],
        map_summary,
    )
    .optional()?
    .ok_or(AiError::ConfigNotFound)
}

fn map_summary(row: &Row) -> rusqlite::Result<ConfigSummary> {
    Ok(ConfigSummary {
        config_id: row.get(0)?,
        owner_id: row.get(1)?,
        provider: row.get(2)?,
        model_name: row.get(3)?,
        endpoint_override: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        is_default: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn audit(conn: &Connection, code: &str, message: &str, data: serde_json::Value) {
    if let Err(err) = log_event(
        conn,
        "info",
        Some(code),
        "ai.registry",
        message,
        None,
        Some(data),
    ) {
        log::error!(target: "ai.registry", "failed to record {code}: {err}");
    }
}

fn audit_failure(conn: &Connection, config_id: &str, err: &AiError) {
    if let Err(log_err) = log_event(
        conn,
        "error",
        Some(err.code()),
        "ai.registry",
        "stored credential could not be decrypted",
        Some(err.explain()),
        Some(json!({ "config_id": config_id })),
    ) {
        log::error!(target: "ai.registry", "failed to record decrypt failure: {log_err}");
    }
}
