//! Convoy configuration (`convoy.yaml`).

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::batch::{AutoReplySettings, BatchSettings};
use crate::dedup::DedupSettings;
use crate::supervisor::BackoffPolicy;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub auto_reply: AutoReplyConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub triggers: TriggersConfig,
}

impl Config {
    /// Load config from a YAML file. A missing file yields defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let config: Self = serde_saphyr::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_reply.min_messages == 0 {
            return Err(ConfigError::Invalid(
                "auto_reply.min_messages must be at least 1".to_string(),
            ));
        }
        if self.dedup.sweep_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "dedup.sweep_interval_seconds must be at least 1".to_string(),
            ));
        }
        if self.connection.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connection.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.connection.max_delay_ms < self.connection.base_delay_ms {
            return Err(ConfigError::Invalid(
                "connection.max_delay_ms must be >= connection.base_delay_ms".to_string(),
            ));
        }
        if self.batching.max_wait_ms < self.batching.debounce_ms {
            return Err(ConfigError::Invalid(
                "batching.max_wait_ms must be >= batching.debounce_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_settings(&self) -> BatchSettings {
        BatchSettings {
            startup_window: Duration::from_millis(self.batching.startup_window_ms),
            debounce: Duration::from_millis(self.batching.debounce_ms),
            max_wait: Duration::from_millis(self.batching.max_wait_ms),
            auto_reply: self.auto_reply.enabled.then(|| AutoReplySettings {
                debounce: Duration::from_millis(self.auto_reply.debounce_ms),
                min_messages: self.auto_reply.min_messages,
                min_time_window: Duration::from_millis(self.auto_reply.min_time_window_ms),
            }),
        }
    }

    pub fn dedup_settings(&self) -> DedupSettings {
        DedupSettings {
            retention: Duration::from_secs(self.dedup.retention_seconds),
            sweep_interval: Duration::from_secs(self.dedup.sweep_interval_seconds),
            max_message_age: Duration::from_secs(self.dedup.max_message_age_seconds),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.connection.base_delay_ms),
            max_delay: Duration::from_millis(self.connection.max_delay_ms),
            max_attempts: self.connection.max_attempts,
        }
    }
}

// ============================================================================
// BatchingConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Grace window after connecting during which new conversations batch
    /// their backlog into a single flush.
    #[serde(default = "default_startup_window")]
    pub startup_window_ms: u64,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// Upper bound on how long a triggered batch may wait, from first trigger.
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            startup_window_ms: default_startup_window(),
            debounce_ms: default_debounce(),
            max_wait_ms: default_max_wait(),
        }
    }
}

fn default_startup_window() -> u64 {
    10_000
}

fn default_debounce() -> u64 {
    2_000
}

fn default_max_wait() -> u64 {
    10_000
}

// ============================================================================
// AutoReplyConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoReplyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_auto_reply_debounce")]
    pub debounce_ms: u64,
    #[serde(default = "default_min_messages")]
    pub min_messages: usize,
    #[serde(default = "default_min_time_window")]
    pub min_time_window_ms: u64,
}

impl Default for AutoReplyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_auto_reply_debounce(),
            min_messages: default_min_messages(),
            min_time_window_ms: default_min_time_window(),
        }
    }
}

fn default_auto_reply_debounce() -> u64 {
    5_000
}

fn default_min_messages() -> usize {
    5
}

fn default_min_time_window() -> u64 {
    60_000
}

// ============================================================================
// DedupConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_retention")]
    pub retention_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Messages older than this are stale even without a watermark.
    #[serde(default = "default_max_message_age")]
    pub max_message_age_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_seconds: default_retention(),
            sweep_interval_seconds: default_sweep_interval(),
            max_message_age_seconds: default_max_message_age(),
        }
    }
}

fn default_retention() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_max_message_age() -> u64 {
    30 * 60
}

// ============================================================================
// ConnectionConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Idle batches are pruned by the sweep task after this long.
    #[serde(default = "default_batch_idle_prune")]
    pub batch_idle_prune_seconds: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: default_max_attempts(),
            batch_idle_prune_seconds: default_batch_idle_prune(),
        }
    }
}

fn default_base_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_batch_idle_prune() -> u64 {
    60 * 60
}

// ============================================================================
// IdentityConfig / CredentialsConfig
// ============================================================================

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub bot_name: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub app_secret: Option<String>,
}

// ============================================================================
// TriggersConfig
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggersConfig {
    #[serde(default = "default_true")]
    pub mention: bool,
    #[serde(default = "default_true")]
    pub direct_messages: bool,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Default for TriggersConfig {
    fn default() -> Self {
        Self {
            mention: true,
            direct_messages: true,
            keywords: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Tests
// ============================================================================
