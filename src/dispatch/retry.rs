//! Exponential backoff with jitter for failed deliveries.

use std::time::Duration;

use rand::Rng;

/// Delivery attempt budget and backoff curve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts allowed per entry (first attempt included)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// `true` once `attempts` deliveries have been made and none may follow
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Un-jittered delay after the given (1-based) failed attempt.
    ///
    /// `base * 2^(attempt - 1)`, clamped to `max_delay`.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Delay to wait after the given failed attempt.
    ///
    /// Drawn uniformly from the upper half of the exponential delay so
    /// retries from many targets spread out without collapsing to zero.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.exponential(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let floor = ceiling / 2;
        Duration::from_millis(rand::rng().random_range(floor..=ceiling))
    }
}
