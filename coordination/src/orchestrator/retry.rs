//! Exponential backoff policy for retried invocations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay after failed attempt `attempt` (0-indexed):
    /// `min(initial × multiplier^attempt, max)`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.initial_backoff_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.min(i32::MAX as u32) as i32);
        if delay.is_finite() {
            (delay as u64).min(self.max_backoff_ms)
        } else {
            self.max_backoff_ms
        }
    }

    /// Whether another retry is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 1s initial backoff, 2x multiplier, 10s max.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
        }
    }
}
