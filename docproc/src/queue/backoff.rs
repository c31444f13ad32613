//! Retry backoff policy.
//!
//! The delay computation and the retry decision are pure functions so they can
//! be exercised without a queue behind them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Base delay of the first retry.
pub const DEFAULT_BASE_DELAY_MS: u64 = 5_000;

/// Upper bound for any retry delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;

/// Delay before retry number `retry_count + 1` with the default policy:
/// `min(300s, 5s * 2^retry_count)`.
pub fn next_delay(retry_count: u32) -> Duration {
    RetryPolicy::default().next_delay(retry_count)
}

/// Capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

/// Outcome of applying the retry policy to a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt. `attempt` is the new retry count.
    Retry { attempt: u32, delay: Duration },
    /// The retry budget is used up.
    Exhausted,
    /// The error is not retryable; fail without consuming the budget.
    Permanent,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        }
    }

    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let factor = if retry_count >= 63 {
            u64::MAX
        } else {
            1u64 << retry_count
        };
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }

    /// Decide what happens to a task that just failed.
    pub fn transition(&self, retry_count: u32, max_retries: u32, retryable: bool) -> RetryDecision {
        if !retryable {
            return RetryDecision::Permanent;
        }
        if retry_count < max_retries {
            RetryDecision::Retry {
                attempt: retry_count + 1,
                delay: self.next_delay(retry_count),
            }
        } else {
            RetryDecision::Exhausted
        }
    }
}
