//! Sync engine configuration
//!
//! All durations are stored as milliseconds so the config round-trips through
//! JSON unchanged; accessor methods return `Duration`s.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Tunables shared by client and server replicas.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A replica unseen for longer than this is truant and must fully resync.
    pub truancy_threshold_ms: u64,
    /// How often a client sends a heartbeat.
    pub heartbeat_interval_ms: u64,
    /// How long a client waits for a heartbeat response before giving up on
    /// the connection.
    pub heartbeat_timeout_ms: u64,
    /// Window for coalescing rapid local writes.
    pub batch_window_ms: u64,
    /// Flush the batch early once it holds this many operations.
    pub batch_max_size: usize,
    /// Maximum undo entries kept per replica.
    pub undo_history_limit: usize,
    /// First reconnect delay; doubles on each failure.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Run the rebase coordinator whenever an ack arrives.
    pub rebase_on_ack: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            truancy_threshold_ms: 14 * DAY_MS,
            heartbeat_interval_ms: 15_000,
            heartbeat_timeout_ms: 5_000,
            batch_window_ms: 200,
            batch_max_size: 100,
            undo_history_limit: 100,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            rebase_on_ack: true,
        }
    }
}

impl SyncConfig {
    /// Read a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: SyncConfig = serde_json::from_slice(&data)
            .map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 || self.batch_window_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        if self.heartbeat_timeout_ms == 0 || self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat timeout must be shorter than the heartbeat interval".into(),
            ));
        }
        if self.reconnect_base_delay_ms == 0 || self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid("reconnect delays out of order".into()));
        }
        Ok(())
    }

    pub fn truancy_threshold(&self) -> Duration {
        Duration::from_millis(self.truancy_threshold_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .reconnect_base_delay_ms
            .saturating_mul(factor)
            .min(self.reconnect_max_delay_ms);
        Duration::from_millis(millis)
    }
}
