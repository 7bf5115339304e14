//! Retry backoff for failed jobs.
//!
//! Failed jobs are not retried immediately: the worker schedules the next
//! attempt `base * 2^attempt` milliseconds into the future, plus a uniform
//! random jitter in `[0, base)` so that a burst of simultaneous failures does
//! not retry in lockstep.

use rand::Rng;
use std::time::Duration;

/// Default base delay between retries, in milliseconds.
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// Exponent cap keeping the shift well inside u64 range.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Exponential backoff policy with additive uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_ms: u64,
}

impl RetryPolicy {
    /// Create a policy with the given base delay in milliseconds.
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms: base_ms.max(1),
        }
    }

    /// Base delay in milliseconds.
    pub fn base_ms(&self) -> u64 {
        self.base_ms
    }

    /// Compute the delay before the next attempt, given how many attempts
    /// have already run.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use conveyor::retry::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(1_000);
    /// let delay = policy.delay_for_attempt(2);
    /// // 1000 * 2^2 = 4000, plus up to (but excluding) 1000ms of jitter
    /// assert!(delay.as_millis() >= 4_000 && delay.as_millis() < 5_000);
    /// ```
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.clamp(0, MAX_BACKOFF_EXPONENT as i32) as u32;
        let backoff_ms = self.base_ms.saturating_mul(1u64 << exponent);
        let jitter_ms = rand::thread_rng().gen_range(0..self.base_ms);
        Duration::from_millis(backoff_ms.saturating_add(jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_BASE_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy::new(1_000);
        for attempt in 0..6 {
            let expected_ms = 1_000u128 << attempt;
            let delay = policy.delay_for_attempt(attempt as i32).as_millis();
            assert!(delay >= expected_ms, "attempt {attempt}: {delay}");
            assert!(delay < expected_ms + 1_000, "attempt {attempt}: {delay}");
        }
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::new(500);
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((500..1_000).contains(&delay));
        }
    }

    #[test]
    fn test_negative_attempt_treated_as_zero() {
        let policy = RetryPolicy::new(1_000);
        let delay = policy.delay_for_attempt(-3).as_millis();
        assert!((1_000..2_000).contains(&delay));
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let policy = RetryPolicy::new(1_000);
        let _ = policy.delay_for_attempt(i32::MAX);
    }

    #[test]
    fn test_default_base() {
        assert_eq!(RetryPolicy::default().base_ms(), DEFAULT_RETRY_BASE_MS);
    }
}
