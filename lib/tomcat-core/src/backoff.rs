//! Retry delays for failed reconciliations

use std::time::Duration;

/// Exponential backoff capped at a maximum delay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before the retry that follows `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let base = self.initial.as_millis() as u64;
        let exponential = 2u64.saturating_pow(failures.saturating_sub(1));
        let delay_ms = base
            .saturating_mul(exponential)
            .min(self.max.as_millis() as u64);
        Duration::from_millis(delay_ms)
    }
}
