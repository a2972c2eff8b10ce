// Copyright (c) James Kassemi, SC, US. All rights reserved.
use config::{Config, ConfigBuilder, File, FileFormat, builder::DefaultState};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "presenced.toml";
pub const ENV_PREFIX: &str = "PRESENCE";
pub const GATEWAY_PLACEHOLDER: &str = "{gateway}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("presence.buffer_window_secs must be greater than zero")]
    ZeroBufferWindow,
    #[error("presence.sweep_interval_secs must be greater than zero")]
    ZeroSweepInterval,
    #[error("broker.url is empty")]
    MissingBrokerUrl,
    #[error("broker.topic_pattern '{pattern}' must contain exactly one {{gateway}} placeholder")]
    InvalidTopicPattern { pattern: String },
}

/// Top-level daemon configuration: defaults, then `presenced.toml`, then `PRESENCE__*` env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default = "default_status_log_interval_secs")]
    pub status_log_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            presence: PresenceConfig::default(),
            storage: StorageConfig::default(),
            metrics: MetricsConfig::default(),
            status_log_interval_secs: default_status_log_interval_secs(),
        }
    }
}

fn default_status_log_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub url: String,
    #[serde(default = "default_topic_pattern")]
    pub topic_pattern: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: default_broker_url(),
            topic_pattern: default_topic_pattern(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_broker_url() -> String {
    "ws://127.0.0.1:8083/pubsub".to_string()
}

fn default_topic_pattern() -> String {
    format!("gw/{GATEWAY_PLACEHOLDER}/status")
}

/// Reconnect backoff knobs for the broker subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

impl RetryConfig {
    /// Reconnects never give up, so the attempt cap is irrelevant here.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            usize::MAX,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_pct,
        )
    }
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_pct() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_buffer_window_secs")]
    pub buffer_window_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default)]
    pub close_on_shutdown: bool,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            buffer_window_secs: default_buffer_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            close_on_shutdown: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl PresenceConfig {
    pub fn buffer_window(&self) -> Duration {
        Duration::from_secs(self.buffer_window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_buffer_window_secs() -> u64 {
    5
}

fn default_sweep_interval_secs() -> u64 {
    5
}

fn default_channel_capacity() -> usize {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("presence.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9095))
}

impl AppConfig {
    /// Loads `path` (required) or `presenced.toml` (optional), then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let builder = Config::builder().add_source(file).add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        Self::finish(builder)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Self::finish(Config::builder().add_source(File::from_str(raw, FileFormat::Toml)))
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence.buffer_window_secs == 0 {
            return Err(ConfigError::ZeroBufferWindow);
        }
        if self.presence.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::MissingBrokerUrl);
        }
        if self.broker.topic_pattern.matches(GATEWAY_PLACEHOLDER).count() != 1 {
            return Err(ConfigError::InvalidTopicPattern {
                pattern: self.broker.topic_pattern.clone(),
            });
        }
        Ok(())
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_source_yields_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.presence.buffer_window(), Duration::from_secs(5));
        assert_eq!(config.presence.sweep_interval(), Duration::from_secs(5));
        assert!(!config.presence.close_on_shutdown);
        assert_eq!(config.broker.topic_pattern, "gw/{gateway}/status");
        assert_eq!(config.storage.database_path, PathBuf::from("presence.db"));
        assert_eq!(config.metrics.addr.port(), 9095);
    }

    #[test]
    fn toml_overrides_sections() {
        let raw = r#"
            status_log_interval_secs = 10

            [broker]
            url = "ws://broker:9001/ws"
            topic_pattern = "site/a/{gateway}"

            [presence]
            buffer_window_secs = 12
            sweep_interval_secs = 3
            close_on_shutdown = true
        "#;
        let config = AppConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.broker.url, "ws://broker:9001/ws");
        assert_eq!(config.broker.topic_pattern, "site/a/{gateway}");
        assert_eq!(config.presence.buffer_window_secs, 12);
        assert_eq!(config.presence.sweep_interval_secs, 3);
        assert!(config.presence.close_on_shutdown);
        assert_eq!(config.status_log_interval(), Duration::from_secs(10));
        assert_eq!(config.broker.retry.base_delay_ms, 500);
    }

    #[test]
    fn rejects_zero_buffer_window() {
        let err = AppConfig::from_toml_str("[presence]\nbuffer_window_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBufferWindow));
    }

    #[test]
    fn rejects_pattern_without_placeholder() {
        let err = AppConfig::from_toml_str("[broker]\ntopic_pattern = \"gw/status\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTopicPattern { .. }));
    }

    #[test]
    fn explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());

        let path = dir.path().join("presenced.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[storage]\ndatabase_path = \"/var/lib/presence.db\"").unwrap();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(
            config.storage.database_path,
            PathBuf::from("/var/lib/presence.db")
        );
    }
}
