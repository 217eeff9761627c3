//! Engine configuration and retry/backoff policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard bound on waiting for a backend to report itself connected.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: None,
        }
    }
}

/// Delay before retry number `attempt` (1-based).
///
/// Factors below 1.0 (or not finite) are treated as 1.0, so the delay never
/// shrinks and never goes negative.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let factor = sanitize_factor(config.backoff_factor, 1.0);
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay_secs = config.initial_delay.as_secs_f64() * factor.powi(exponent);

    let max_secs = config.max_delay.as_secs_f64();
    if delay_secs.is_finite() && delay_secs < max_secs {
        Duration::from_secs_f64(delay_secs)
    } else {
        config.max_delay
    }
}

fn sanitize_factor(factor: f64, fallback: f64) -> f64 {
    if factor.is_finite() { factor.max(1.0) } else { fallback }
}

/// Attempt counter for one retrying loop.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
}

impl RetryState {
    /// Record a failure and return how long to wait before the next attempt.
    pub fn next_delay(&mut self, config: &RetryConfig) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        calculate_backoff(self.attempts, config)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exceeded(&self, config: &RetryConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Tunables for the sync engines.
///
/// Every field has a default so partial JSON documents load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub retry_backoff_factor: f64,

    /// Enqueue every known doc when the index engine starts.
    #[serde(default = "default_true")]
    pub full_index_on_start: bool,

    /// Upper bound of the pause between two index jobs.
    #[serde(default = "default_index_idle_ms")]
    pub index_idle_yield_ms: u64,

    /// Minimum spacing of reactive search re-queries.
    #[serde(default = "default_search_throttle_ms")]
    pub search_throttle_ms: u64,

    /// How often the blob engine reclaims soft-deleted blobs.
    #[serde(default = "default_blob_release_ms")]
    pub blob_release_interval_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT.as_millis() as u64
}

fn default_retry_initial_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_index_idle_ms() -> u64 {
    200
}

fn default_search_throttle_ms() -> u64 {
    3_000
}

fn default_blob_release_ms() -> u64 {
    5 * 60 * 1_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_initial_delay_ms: default_retry_initial_ms(),
            retry_max_delay_ms: default_retry_max_ms(),
            retry_backoff_factor: default_backoff_factor(),
            full_index_on_start: default_true(),
            index_idle_yield_ms: default_index_idle_ms(),
            search_throttle_ms: default_search_throttle_ms(),
            blob_release_interval_ms: default_blob_release_ms(),
        }
    }
}

impl SyncConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_factor: sanitize_factor(self.retry_backoff_factor, default_backoff_factor()),
            max_attempts: None,
        }
    }

    pub fn index_idle_yield(&self) -> Duration {
        Duration::from_millis(self.index_idle_yield_ms)
    }

    pub fn search_throttle(&self) -> Duration {
        Duration::from_millis(self.search_throttle_ms)
    }

    pub fn blob_release_interval(&self) -> Duration {
        Duration::from_millis(self.blob_release_interval_ms)
    }
}
