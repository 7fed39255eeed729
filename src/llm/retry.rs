//! Bounded retry with exponential backoff and jitter.

use std::time::Duration;

use rand::Rng;

/// Retry policy for a single failable call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never below 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Base delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Delay with up to 25% random jitter added, still capped at `max_backoff`.
    ///
    /// A server hint (e.g. `Retry-After`) wins when larger.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_cap = base.as_millis() as u64 / 4;
        let jitter = if jitter_cap > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_cap))
        } else {
            Duration::ZERO
        };
        let delay = (base + jitter).min(self.max_backoff);
        match hint {
            Some(h) if h > delay => h,
            _ => delay,
        }
    }

    pub fn has_attempts_left(&self, used: u32) -> bool {
        used < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(30))
    }
}
