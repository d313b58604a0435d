//! Engine configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::DEFAULT_DEDUP_CAPACITY;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Reconnection backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts per disconnect episode before giving up.
    pub max_attempts: u32,
    /// Delay before the first attempt; doubled per attempt.
    pub base_delay_ms: u64,
    /// Upper bound of any delay, jitter included.
    pub max_delay_ms: u64,
    /// Random extra delay added to each attempt.
    pub max_jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 16_000,
            max_jitter_ms: 500,
        }
    }
}

impl ReconnectConfig {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    #[must_use]
    pub const fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }
}

/// Session engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reconnect: ReconnectConfig,
    /// Size of the dedup window.
    pub dedup_capacity: usize,
    /// Sent as the `helper` flag of the handshake.
    pub helper: bool,
    /// Keepalive ping interval while connected.
    pub heartbeat_interval_ms: Option<u64>,
    /// Model requested when `connect` is given none.
    pub default_model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            helper: false,
            heartbeat_interval_ms: None,
            default_model: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error on malformed TOML or invalid values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dedup_capacity == 0 {
            return Err(ConfigError::Invalid("dedup_capacity must be > 0".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "reconnect.max_attempts must be > 0".into(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        if self.heartbeat_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Heartbeat period. A zero interval disables the heartbeat.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_ms
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
    }
}
