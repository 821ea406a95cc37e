//! Exponential backoff for outbox redelivery.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Backoff schedule applied after a failed publish.
///
/// The n-th retry waits `base_delay * multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Creates a doubling policy.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            multiplier: 2,
        }
    }

    /// Sets the growth factor between consecutive retries.
    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    /// Delay before the retry that follows failure number `retry_count`.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = (retry_count - 1).clamp(0, 31) as u32;
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Instant at which the row becomes due again.
    pub fn next_attempt_at(&self, retry_count: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        now + TimeDelta::milliseconds(delay.as_millis() as i64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}
