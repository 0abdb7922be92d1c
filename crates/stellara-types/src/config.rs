//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls
//! default retry/timeout policy, backoff, and idempotency retention.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the saga engine.
///
/// Loaded from `~/.stellara/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-attempt deadline for steps that do not declare their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Retries (beyond the initial attempt) for steps that do not declare their own.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Delay between retry attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// How long a terminal outcome stays cached under its idempotency key.
    #[serde(default = "default_idempotency_retention_secs")]
    pub idempotency_retention_secs: u64,

    /// How long a non-terminal run must go without a checkpoint before an
    /// operator may abandon it without forcing.
    #[serde(default = "default_stale_run_secs")]
    pub stale_run_secs: u64,

    /// Capacity of the broadcast channel carrying `SagaEvent`s.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Overrides the SQLite URL derived from the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_idempotency_retention_secs() -> u64 {
    86_400
}

fn default_stale_run_secs() -> u64 {
    3_600
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            default_max_retries: default_max_retries(),
            backoff: BackoffConfig::default(),
            idempotency_retention_secs: default_idempotency_retention_secs(),
            stale_run_secs: default_stale_run_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            database_url: None,
        }
    }
}

/// Backoff growth between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always `base_delay_ms`.
    Fixed,
    /// `base_delay_ms * retry`.
    Linear,
    /// `base_delay_ms * 2^(retry - 1)`.
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_strategy")]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_backoff_strategy() -> BackoffStrategy {
    BackoffStrategy::Exponential
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: default_backoff_strategy(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}
