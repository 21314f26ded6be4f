//! Retry policy: attempt limit and exponential backoff with jitter.
//!
//! Delay before retry `n` (1-based attempt that just failed) is
//! `base_delay * 2^(n - 1)`, capped at `max_delay`, plus up to 20% jitter.
//! The jittered value is clamped to `max_delay` again, so the delays of a
//! repeatedly failing record never decrease.

use std::time::Duration;

use courier_common::config::DispatchConfig;

/// Maximum jitter as a fraction of the computed delay.
const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempt_count` attempts.
    pub fn can_retry(&self, attempt_count: i32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Deterministic delay after the `attempt_count`-th failed attempt.
    pub fn base_delay_for(&self, attempt_count: i32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).clamp(0, 31) as u32;
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay after the `attempt_count`-th failed attempt, with random jitter.
    pub fn delay_for(&self, attempt_count: i32) -> Duration {
        self.jittered(attempt_count, rand::random::<f64>())
    }

    /// Apply a jitter factor in `[0, 1)` to the deterministic delay.
    fn jittered(&self, attempt_count: i32, factor: f64) -> Duration {
        let delay = self.base_delay_for(attempt_count);
        let jitter = delay.mul_f64(JITTER_RATIO * factor.clamp(0.0, 1.0));
        (delay + jitter).min(self.max_delay)
    }
}
