//! Retry and backoff policy for message processing
//!
//! Retries are redeliveries: the worker seeks the partition back to the failed
//! offset and waits `next_delay(attempt)` before the broker hands the message
//! out again. The only state involved is the per-message attempt counter the
//! worker keeps in an [`AttemptTracker`].
//!
//! ```text
//! attempt 1 fails (transient) -> wait initial
//! attempt 2 fails (transient) -> wait initial * multiplier
//! ...
//! attempt max_attempts fails  -> terminal, dead-lettered
//! ```
//!
//! Decode and validation failures are terminal on the first attempt.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::ProcessingConfig;
use crate::kafka::processor::ProcessingError;

/// Whether a failed attempt should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Terminal,
}

/// Bounded exponential backoff.
///
/// `next_delay(n) = min(initial_delay * multiplier^(n - 1), max_delay)`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed per message, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl From<&ProcessingConfig> for RetryPolicy {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
            multiplier: config.retry_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Classify the failure of the `attempt`-th try (1-based)
    pub fn classify(&self, error: &ProcessingError, attempt: u32) -> FailureClass {
        if error.is_transient() && attempt < self.max_attempts {
            FailureClass::Retryable
        } else {
            FailureClass::Terminal
        }
    }

    /// Wait before redelivering after the `attempt`-th failure (1-based)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_delay.as_secs_f64();
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if delay.is_finite() && delay < max {
            Duration::from_secs_f64(delay.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Whether `attempts` failures used up the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Failed attempts per in-flight message, keyed by partition and offset
#[derive(Debug, Default)]
pub struct AttemptTracker {
    failures: HashMap<(i32, i64), u32>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The attempt number the next delivery of this message represents
    pub fn current(&self, partition: i32, offset: i64) -> u32 {
        self.failures.get(&(partition, offset)).copied().unwrap_or(0) + 1
    }

    /// Count a failed attempt, returning the total failures so far
    pub fn record_failure(&mut self, partition: i32, offset: i64) -> u32 {
        let failures = self.failures.entry((partition, offset)).or_insert(0);
        *failures += 1;
        *failures
    }

    /// Forget a message once it reached a terminal state
    pub fn clear(&mut self, partition: i32, offset: i64) {
        self.failures.remove(&(partition, offset));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
