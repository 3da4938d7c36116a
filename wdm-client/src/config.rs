//! Configuration loading for a WDM node.
//!
//! Configuration is loaded from a TOML file (default: `wdm.toml`).
//!
//! ```toml
//! [node]
//! node_id = 0x18B4300000000001
//!
//! [event_log]
//! logging_threshold = "info"
//! counter_file = "/var/lib/wdm/counters.json"
//!
//! [[event_log.tiers]]
//! importance = "debug"
//! capacity_bytes = 2048
//!
//! [[event_log.tiers]]
//! importance = "production_critical"
//! capacity_bytes = 8192
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wdm_core::{CounterStore, LogSettings, TierConfig, DEFAULT_EPOCH};
use wdm_types::Importance;

/// Root configuration for a WDM node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Node identity.
    #[serde(default)]
    pub node: NodeConfig,
    /// Event log layout and flush policy.
    #[serde(default)]
    pub event_log: EventLogConfig,
    /// Subscription engine limits.
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    /// Bulk offload parameters.
    #[serde(default)]
    pub offload: OffloadConfig,
}

/// Node identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// 64-bit node id (default: 1).
    #[serde(default = "default_node_id")]
    pub node_id: u64,
}

/// One tier of the event log.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TierSettings {
    /// Importance band stored in the tier.
    pub importance: Importance,
    /// Storage in bytes.
    pub capacity_bytes: usize,
}

/// Event log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// Tiers, least important first (default: one tier per importance).
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierSettings>,
    /// Events less important than this are discarded (default: debug).
    #[serde(default)]
    pub logging_threshold: Importance,
    /// Bytes logged since the last flush that make a flush due (default: 2048).
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: u64,
    /// Quiet period after an upload in milliseconds (default: 5000).
    #[serde(default = "default_holdoff_ms")]
    pub holdoff_ms: u64,
    /// Event ids reserved per counter write (default: 256).
    #[serde(default = "default_counter_epoch")]
    pub counter_epoch: u64,
    /// File that persists event id counters; volatile counters if unset.
    pub counter_file: Option<PathBuf>,
}

/// Subscription engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    /// Size of the handler pool (default: 4).
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,
    /// Byte budget of one Notify (default: 1024).
    #[serde(default = "default_max_notify_bytes")]
    pub max_notify_bytes: usize,
    /// How long a subscriber has to acknowledge a Notify in milliseconds
    /// (default: 10000).
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Bulk offload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Largest block offered to the collector (default: 1024).
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u32,
    /// Name of the uploaded file on the collector (default: "events").
    #[serde(default = "default_file_designator")]
    pub file_designator: String,
    /// How long the collector has to answer in milliseconds (default: 15000).
    #[serde(default = "default_offload_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Node id of the collector that flush-triggered uploads go to. Without
    /// one, the log is only drained by explicit uploads.
    #[serde(default)]
    pub collector: Option<u64>,
}

// Default value functions
fn default_node_id() -> u64 {
    1
}

fn default_tiers() -> Vec<TierSettings> {
    Importance::ALL
        .iter()
        .map(|importance| TierSettings {
            importance: *importance,
            capacity_bytes: 2048,
        })
        .collect()
}

fn default_flush_threshold() -> u64 {
    2048
}

fn default_holdoff_ms() -> u64 {
    5000
}

fn default_counter_epoch() -> u64 {
    DEFAULT_EPOCH
}

fn default_max_subscriptions() -> usize {
    4
}

fn default_max_notify_bytes() -> usize {
    1024
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_max_block_size() -> u32 {
    1024
}

fn default_file_designator() -> String {
    "events".to_string()
}

fn default_offload_timeout_ms() -> u64 {
    15_000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            logging_threshold: Importance::default(),
            flush_threshold_bytes: default_flush_threshold(),
            holdoff_ms: default_holdoff_ms(),
            counter_epoch: default_counter_epoch(),
            counter_file: None,
        }
    }
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: default_max_subscriptions(),
            max_notify_bytes: default_max_notify_bytes(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            max_block_size: default_max_block_size(),
            file_designator: default_file_designator(),
            response_timeout_ms: default_offload_timeout_ms(),
            collector: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { source, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engines cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tiers = &self.event_log.tiers;
        if tiers.is_empty() {
            return Err(ConfigError::Invalid("event_log.tiers is empty".into()));
        }
        let mut seen = HashSet::new();
        for tier in tiers {
            if !seen.insert(tier.importance) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tier for importance {}",
                    tier.importance
                )));
            }
            if tier.capacity_bytes == 0 {
                return Err(ConfigError::Invalid(format!(
                    "tier {} has zero capacity",
                    tier.importance
                )));
            }
        }
        if !tiers.windows(2).all(|w| w[0].importance < w[1].importance) {
            return Err(ConfigError::Invalid(
                "event_log.tiers must be ordered from least to most important".into(),
            ));
        }
        if self.event_log.counter_epoch == 0 {
            return Err(ConfigError::Invalid("event_log.counter_epoch is zero".into()));
        }
        if self.subscriptions.max_notify_bytes == 0 {
            return Err(ConfigError::Invalid(
                "subscriptions.max_notify_bytes is zero".into(),
            ));
        }
        if self.offload.max_block_size == 0 {
            return Err(ConfigError::Invalid("offload.max_block_size is zero".into()));
        }
        Ok(())
    }

    /// Log-wide settings.
    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            logging_threshold: self.event_log.logging_threshold,
            flush_threshold_bytes: self.event_log.flush_threshold_bytes,
            holdoff: Duration::from_millis(self.event_log.holdoff_ms),
            node_id: self.node.node_id,
        }
    }

    /// Tier layout. With a store, every tier gets a persisted counter.
    pub fn tier_configs<S>(&self, store: Option<S>) -> Vec<TierConfig>
    where
        S: CounterStore + Clone + 'static,
    {
        self.event_log
            .tiers
            .iter()
            .map(|tier| match &store {
                Some(store) => TierConfig::persisted(
                    tier.importance,
                    tier.capacity_bytes,
                    Box::new(store.clone()),
                    self.event_log.counter_epoch,
                ),
                None => TierConfig::volatile(tier.importance, tier.capacity_bytes),
            })
            .collect()
    }

    /// Notify acknowledgement timeout.
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriptions.response_timeout_ms)
    }

    /// Collector response timeout.
    pub fn offload_timeout(&self) -> Duration {
        Duration::from_millis(self.offload.response_timeout_ms)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Values that parse but cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
