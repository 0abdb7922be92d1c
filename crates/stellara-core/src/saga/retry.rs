//! Retry and backoff policy for step attempts.
//!
//! `BackoffPolicy` turns a retry number into a delay. `RetryController` is
//! the per-step attempt state machine: it counts attempts, decides whether a
//! failed attempt may be retried, and hands out the delay before the next
//! one. Deadlines are applied by the step executor around each attempt.

use std::time::Duration;

use stellara_types::config::{BackoffConfig, BackoffStrategy};
use stellara_types::error::StepError;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Delay schedule between retry attempts.
///
/// `delay_for` is monotonically non-decreasing in `retry` and never exceeds
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// No waiting between attempts.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based). `0` yields no delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let base = saturating_millis(self.base_delay);
        let millis = match self.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(retry - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            strategy: config.strategy,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

// ---------------------------------------------------------------------------
// RetryController
// ---------------------------------------------------------------------------

/// Attempt bookkeeping for one step.
///
/// ```text
/// new -> begin_attempt (attempt 1) -> [failure] -> should_retry?
///          ^                                          | yes: next_delay
///          +------------------------------------------+
///                                                     | no: exhausted
/// ```
#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    backoff: BackoffPolicy,
    attempts: u32,
}

impl RetryController {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
            attempts: 0,
        }
    }

    /// Start a new attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Retries consumed so far (attempts beyond the first).
    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the attempt that just failed with `error` may be retried.
    ///
    /// Validation and permanent failures never retry; timeouts and transient
    /// failures retry while the budget lasts.
    pub fn should_retry(&self, error: &StepError) -> bool {
        error.is_retryable() && self.retries_used() < self.max_retries
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.backoff.delay_for(self.attempts.max(1))
    }
}
