//! Engine configuration types for stepwise.
//!
//! `EngineConfig` represents the `stepwise.toml` file that tunes step
//! timeouts, retry pacing, checkpoint cadence, the event channel, storage,
//! and logging. Every field has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to steps that declare none (None = unbounded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_ms: Option<u64>,

    /// Fixed delay between retry attempts of a failing step.
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Write a checkpoint after every settled batch.
    #[serde(default = "default_checkpoint_every_batch")]
    pub checkpoint_every_batch: bool,

    /// Capacity of the lifecycle event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Checkpoint store location (e.g. `sqlite:///var/lib/stepwise/stepwise.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_checkpoint_every_batch() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: None,
            retry_backoff_ms: 0,
            checkpoint_every_batch: default_checkpoint_every_batch(),
            event_capacity: default_event_capacity(),
            database_url: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
