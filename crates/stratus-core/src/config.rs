//! stratus.toml configuration parser.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StratusConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the redb database file.
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum attempts for a job whose handler keeps failing with a
    /// transient remote-communication error.
    #[serde(default = "default_remote_retry_limit")]
    pub remote_retry_limit: u32,
    /// Pause between remote attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Timeout applied to jobs that don't declare their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_retry_limit: default_remote_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            default_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without a report after which a node reads as inactive.
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
    /// Capability id of the score plugin.
    #[serde(default = "default_score_plugin")]
    pub score_plugin: String,
    /// Parameters handed to the score plugin factory.
    #[serde(default)]
    pub score_params: toml::Table,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_secs: default_liveness_secs(),
            score_plugin: default_score_plugin(),
            score_params: toml::Table::new(),
        }
    }
}

impl RegistryConfig {
    /// Score parameters as a JSON value, the form plugin factories accept.
    pub fn score_params_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.score_params).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Capability ids of the extra placement filters, applied in order.
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            filters: default_filters(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/stratus/stratus.redb")
}

fn default_remote_retry_limit() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_liveness_secs() -> u64 {
    30
}

fn default_score_plugin() -> String {
    "weighted".to_string()
}

fn default_filters() -> Vec<String> {
    vec!["not-draining".to_string()]
}

impl StratusConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: StratusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.executor.remote_retry_limit == 0 {
            anyhow::bail!("executor.remote_retry_limit must be at least 1");
        }
        if self.registry.score_plugin.trim().is_empty() {
            anyhow::bail!("registry.score_plugin must not be empty");
        }
        Ok(())
    }
}
