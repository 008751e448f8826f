//! Coordination configuration.
//!
//! Tuning values for the gossip, queue and registry components. Every section
//! has defaults, so an empty TOML document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Settings for inbound gossip handling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GossipConfig {
    /// Debounce window applied to request announcements, in seconds.
    pub nonce_period_secs: u64,
    /// Lifetime given to cached messages that carry no expiry, in seconds.
    pub message_expiration_secs: u64,
    /// Interval between dedup cache prune sweeps, in seconds.
    pub prune_interval_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            nonce_period_secs: 5,
            message_expiration_secs: 30,
            prune_interval_secs: 60,
        }
    }
}

impl GossipConfig {
    /// The debounce window.
    #[must_use]
    pub const fn nonce_period(&self) -> Duration {
        Duration::from_secs(self.nonce_period_secs)
    }

    /// Lifetime of cached messages that carry no expiry.
    #[must_use]
    pub const fn message_expiration(&self) -> Duration {
        Duration::from_secs(self.message_expiration_secs)
    }

    /// The prune interval.
    #[must_use]
    pub const fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Settings for the persistent job scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of jobs running at once.
    pub concurrency_limit: usize,
    /// Delay before a failed job becomes eligible again, in milliseconds.
    pub retry_delay_ms: u64,
    /// Interval between scheduler wake-ups, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Lifetime given to jobs added without an explicit expiry, in seconds.
    pub default_expiration_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            retry_delay_ms: 1000,
            heartbeat_interval_secs: 1,
            default_expiration_secs: 3600,
        }
    }
}

impl QueueConfig {
    /// The retry delay.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// The heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Sets the concurrency limit.
    #[must_use]
    pub const fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    /// Sets the retry delay in milliseconds.
    #[must_use]
    pub const fn with_retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }
}

/// Settings for the client-side request registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Storage key holding the registry snapshot.
    pub storage_key: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            storage_key: "requests".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// Gossip handling.
    #[serde(default)]
    pub gossip: GossipConfig,
    /// Job scheduling.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Request registry.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl CoordinationConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("gossip.nonce_period_secs", self.gossip.nonce_period_secs)?;
        positive("gossip.message_expiration_secs", self.gossip.message_expiration_secs)?;
        positive("gossip.prune_interval_secs", self.gossip.prune_interval_secs)?;
        positive("queue.concurrency_limit", self.queue.concurrency_limit as u64)?;
        positive("queue.heartbeat_interval_secs", self.queue.heartbeat_interval_secs)?;
        positive("queue.default_expiration_secs", self.queue.default_expiration_secs)?;

        if self.registry.storage_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "registry.storage_key",
                reason: "cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}
