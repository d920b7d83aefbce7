//! Bounded retry policy with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;

/// Retry policy applied between fetch attempts.
///
/// The delay before retrying attempt `n` is `base_delay * 2^n` capped at
/// `max_delay`, plus a uniform random term in `0..=jitter`. Setting `jitter`
/// to zero makes the schedule fully deterministic, which tests rely on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum fetch attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential delay (the jitter term is added on top).
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter term.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the failure of attempt `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let exponential = self.base_delay.saturating_mul(1u32 << shift);
        let capped = exponential.min(self.max_delay);

        if self.jitter.is_zero() {
            return capped;
        }
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = rand::rng().random_range(0..=jitter_ms);
        capped + Duration::from_millis(extra)
    }
}
