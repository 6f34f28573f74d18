//! Retry / backoff policy.

use std::time::Duration;

use rand::Rng;

use crate::envelope::RetryStrategy;

/// Re-enqueue cap for envelopes that fail to decode at fetch time.
///
/// The source this spec was distilled from re-enqueues decode failures with
/// a short fixed delay and no bounded retry count. That is flagged there as possibly-buggy; this implementation
/// takes the suggested safer policy of a small fixed cap before
/// dead-lettering.
pub const DECODE_ERROR_RETRY_LIMIT: u32 = 5;

/// Fixed delay applied when re-enqueuing after a decode failure.
pub const DECODE_ERROR_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default ceiling applied to exponential backoff.
pub const DEFAULT_EXPONENTIAL_CEILING: Duration = Duration::from_secs(3600);

/// Computes retry-or-fail decisions and backoff delays for one task.
///
/// `jitter` adds up to ±10% uniform noise to `exponential` delays to avoid
/// thundering-herd retry storms. It defaults to enabled for `exponential`
/// and disabled for `fixed` — see DESIGN.md for why plain `fixed` delays are
/// left deterministic by default.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub ceiling: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, base_delay: Duration) -> Self {
        RetryPolicy {
            strategy,
            base_delay,
            ceiling: DEFAULT_EXPONENTIAL_CEILING,
            jitter: matches!(strategy, RetryStrategy::Exponential),
        }
    }

    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `should_retry(err) = user_hook(err) && current_attempt < max_attempts`.
    ///
    /// `user_hook` defaults to `true` (everything is retryable) but callers
    /// may pass a classifier that returns `false` for domain errors such as
    /// validation failures.
    pub fn should_retry(
        &self,
        current_attempt: u32,
        max_attempts: u32,
        user_hook_says_retryable: bool,
    ) -> bool {
        user_hook_says_retryable && current_attempt < max_attempts
    }

    /// Computes the delay before the `current_attempt`-th retry (1-indexed,
    /// matching "k-th retry delay" framing).
    pub fn next_delay(&self, current_attempt: u32) -> Duration {
        let base = match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Exponential => {
                let exponent = current_attempt.saturating_sub(1);
                let factor = 2u64.saturating_pow(exponent.min(62));
                let scaled = self.base_delay.as_secs_f64() * factor as f64;
                Duration::from_secs_f64(scaled.min(self.ceiling.as_secs_f64()))
            }
        };

        if !self.jitter {
            return base;
        }

        let mut rng = rand::thread_rng();
        let jitter_fraction: f64 = rng.gen_range(-0.10..=0.10);
        let jittered = base.as_secs_f64() * (1.0 + jitter_fraction);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_strategy_always_returns_base_delay() {
        let policy = RetryPolicy::new(RetryStrategy::Fixed, Duration::from_secs(10));
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(4), Duration::from_secs(10));
    }

    #[test]
    fn exponential_strategy_follows_the_backoff_law() {
        let policy = RetryPolicy::new(RetryStrategy::Exponential, Duration::from_secs(60))
            .with_jitter(false);
        assert_eq!(policy.next_delay(1), Duration::from_secs(60));
        assert_eq!(policy.next_delay(2), Duration::from_secs(120));
        assert_eq!(policy.next_delay(3), Duration::from_secs(240));
        assert_eq!(policy.next_delay(4), Duration::from_secs(480));
    }

    #[test]
    fn exponential_strategy_is_capped_at_the_configured_ceiling() {
        let policy = RetryPolicy::new(RetryStrategy::Exponential, Duration::from_secs(60))
            .with_ceiling(Duration::from_secs(300))
            .with_jitter(false);
        assert_eq!(policy.next_delay(10), Duration::from_secs(300));
    }

    #[test]
    fn jitter_stays_within_ten_percent_of_the_base_delay() {
        let policy = RetryPolicy::new(RetryStrategy::Exponential, Duration::from_secs(100))
            .with_jitter(true);
        for attempt in 1..5 {
            let delay = policy.next_delay(attempt).as_secs_f64();
            let base = 100.0 * 2f64.powi(attempt as i32 - 1);
            assert!(delay >= base * 0.9 - 0.001);
            assert!(delay <= base * 1.1 + 0.001);
        }
    }

    #[test]
    fn should_retry_respects_attempt_ceiling_and_user_hook() {
        let policy = RetryPolicy::new(RetryStrategy::Fixed, Duration::from_secs(1));
        assert!(policy.should_retry(2, 5, true));
        assert!(!policy.should_retry(5, 5, true));
        assert!(!policy.should_retry(2, 5, false));
    }
}
