//! Runtime configuration for the provider subsystem.
//!
//! Everything has a sensible default so the host application can start with
//! `CoreConfig::for_workspace(dir)` and only ship a JSON file when an operator
//! wants to tune deadlines or limits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DATABASE_FILE: &str = "mediation_ai.db";
pub const KEY_FILE: &str = "credentials.key";

/// Upper bounds for the pre-flight probes; larger configured values are capped.
pub const MAX_TEST_HOSTED_SECS: u64 = 10;
pub const MAX_LIVENESS_SECS: u64 = 5;
pub const MAX_GENERATION_PROBE_SECS: u64 = 30;

/// Deadlines applied to outbound provider calls, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub hosted_secs: u64,
    pub local_secs: u64,
    pub test_hosted_secs: u64,
    pub liveness_secs: u64,
    pub generation_probe_secs: u64,
    pub list_models_secs: u64,
    pub pull_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            hosted_secs: 30,
            local_secs: 120,
            test_hosted_secs: 10,
            liveness_secs: 5,
            generation_probe_secs: 30,
            list_models_secs: 10,
            pull_secs: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn hosted(&self) -> Duration {
        Duration::from_secs(self.hosted_secs)
    }

    pub fn local(&self) -> Duration {
        Duration::from_secs(self.local_secs)
    }

    pub fn test_hosted(&self) -> Duration {
        Duration::from_secs(self.test_hosted_secs.min(MAX_TEST_HOSTED_SECS))
    }

    pub fn liveness(&self) -> Duration {
        Duration::from_secs(self.liveness_secs.min(MAX_LIVENESS_SECS))
    }

    pub fn generation_probe(&self) -> Duration {
        Duration::from_secs(self.generation_probe_secs.min(MAX_GENERATION_PROBE_SECS))
    }

    pub fn list_models(&self) -> Duration {
        Duration::from_secs(self.list_models_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub workspace_dir: PathBuf,
    /// Overrides `<workspace>/credentials.key`.
    pub key_file: Option<PathBuf>,
    /// `None` disables the cap.
    pub max_configs_per_owner: Option<usize>,
    pub user_agent: String,
    pub timeouts: TimeoutConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workspace_dir: std::env::temp_dir().join("MediationAI"),
            key_file: None,
            max_configs_per_owner: Some(20),
            user_agent: format!("MediationAI-Core/{}", env!("CARGO_PKG_VERSION")),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn for_workspace(dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. A missing file yields the defaults rooted at
    /// `workspace_dir`; a present but malformed file is an error.
    pub fn load(path: &Path, workspace_dir: impl Into<PathBuf>) -> Result<Self> {
        let workspace_dir = workspace_dir.into();
        if !path.exists() {
            return Ok(Self::for_workspace(workspace_dir));
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config: CoreConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        if config.workspace_dir == Self::default().workspace_dir {
            config.workspace_dir = workspace_dir;
        }
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.workspace_dir.join(DATABASE_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join(KEY_FILE))
    }
}
