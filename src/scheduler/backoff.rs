//! Retry policy for failed attempts

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an attempt ceiling and random jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per subject and version before the subject is marked failed
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the random delay added to every backoff
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after `failures` consecutive failures.
    ///
    /// `base * 2^(failures - 1)`, capped at `max`, plus up to `jitter`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    /// Whether `failures` has reached the ceiling
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts.max(1)
    }
}
