//! Sync configuration loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Config file location relative to the project root.
pub const CONFIG_FILE: &str = ".eternum/sync.yaml";

/// Main sync configuration, loaded from .eternum/sync.yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// World namespace prefixed to every model name
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Indexer base URL
    #[serde(default = "default_torii_url")]
    pub torii_url: String,

    /// Live update batching
    #[serde(default)]
    pub updates: UpdatesConfig,

    /// Fan-out request throttling
    #[serde(default)]
    pub requests: RequestsConfig,

    /// Bulk query page sizes
    #[serde(default)]
    pub queries: QueriesConfig,

    /// Player structure polling
    #[serde(default)]
    pub player_sync: PlayerSyncConfig,

    /// Deletion artifact repairs
    #[serde(default)]
    pub repairs: RepairsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_update_batch_size")]
    pub batch_size: usize,

    /// Trace every queued update
    #[serde(default)]
    pub logging: bool,
}

impl UpdatesConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            batch_size: default_update_batch_size(),
            logging: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestsConfig {
    #[serde(default = "default_request_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl RequestsConfig {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_request_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueriesConfig {
    #[serde(default = "default_entity_limit")]
    pub entity_limit: u32,

    #[serde(default = "default_event_limit")]
    pub event_limit: u32,
}

impl Default for QueriesConfig {
    fn default() -> Self {
        Self {
            entity_limit: default_entity_limit(),
            event_limit: default_event_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSyncConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Tiles added around the bounding box of the player's structures
    #[serde(default = "default_padding")]
    pub padding: u32,
}

impl PlayerSyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for PlayerSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            padding: default_padding(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RepairsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_namespace() -> String {
    "s1_eternum".to_string()
}
fn default_torii_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_debounce_ms() -> u64 {
    50
}
fn default_update_batch_size() -> usize {
    10
}
fn default_request_batch_size() -> usize {
    3
}
fn default_batch_delay_ms() -> u64 {
    100
}
fn default_entity_limit() -> u32 {
    40_000
}
fn default_event_limit() -> u32 {
    20_000
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_padding() -> u32 {
    6
}
fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            torii_url: default_torii_url(),
            updates: UpdatesConfig::default(),
            requests: RequestsConfig::default(),
            queries: QueriesConfig::default(),
            player_sync: PlayerSyncConfig::default(),
            repairs: RepairsConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    }

    /// Load from project root (looks for .eternum/sync.yaml)
    pub fn load_from_project(project_root: &Path) -> Result<Self> {
        let config_path = Self::path_in(project_root);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn path_in(project_root: &Path) -> PathBuf {
        project_root.join(CONFIG_FILE)
    }

    /// Full model name within the configured namespace.
    pub fn model(&self, model: &str) -> String {
        crate::model::model_name(&self.namespace, model)
    }
}
