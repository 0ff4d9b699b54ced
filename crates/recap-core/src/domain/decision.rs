//! Retry/backoff policy: what to do after a failed attempt.
//!
//! Pure and deterministic. Storage and worker timing are not involved, so the
//! decision can be tested on its own.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Floor for every retry delay, so a retried job is never due at the instant it failed.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// The next action for a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, runnable after the delay.
    RetryAfter(Duration),

    /// Terminal failure.
    GiveUp,
}

impl RetryDecision {
    /// The `nextDelay | null` form handed to `QueueStore::fail`.
    pub fn delay(self) -> Option<Duration> {
        match self {
            RetryDecision::RetryAfter(d) => Some(d),
            RetryDecision::GiveUp => None,
        }
    }
}

/// Exponential backoff: `base_delay * 2^(attempts - 1)`.
///
/// Example with base_delay=2s:
/// - attempt 1: 2s
/// - attempt 2: 4s
/// - attempt 3: 8s
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,

    /// Optional cap on a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// `attempts` is the post-increment count of the attempt that just failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32) -> RetryDecision {
        if attempts >= max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for(attempts))
    }

    /// Backoff delay for the given (1-indexed) attempt. `0` is treated as `1`.
    /// Never shorter than [`MIN_RETRY_DELAY`].
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let delay = 2u32
            .checked_pow(exponent)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX);

        let delay = match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        };
        delay.max(MIN_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 3, Some(2000))]
    #[case(2, 3, Some(4000))]
    #[case(3, 3, None)]
    #[case(4, 3, None)]
    #[case(1, 1, None)]
    #[case(3, 5, Some(8000))]
    fn default_policy_decisions(
        #[case] attempts: u32,
        #[case] max_attempts: u32,
        #[case] expected_ms: Option<u64>,
    ) {
        let policy = RetryPolicy::default();
        let decision = policy.decide(attempts, max_attempts);
        assert_eq!(decision.delay(), expected_ms.map(Duration::from_millis));
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn zero_attempts_uses_base_delay() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    }

    #[test]
    fn cap_limits_delay() {
        let policy =
            RetryPolicy::exponential(Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn zero_base_delay_still_waits() {
        let policy = RetryPolicy::exponential(Duration::ZERO);
        assert_eq!(policy.decide(1, 3).delay(), Some(MIN_RETRY_DELAY));

        let capped = RetryPolicy::default().with_max_delay(Duration::ZERO);
        assert_eq!(capped.delay_for(2), MIN_RETRY_DELAY);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    proptest! {
        #[test]
        fn gives_up_exactly_at_ceiling(attempts in 1u32..50, max_attempts in 1u32..50) {
            let decision = RetryPolicy::default().decide(attempts, max_attempts);
            prop_assert_eq!(decision == RetryDecision::GiveUp, attempts >= max_attempts);
        }

        #[test]
        fn delays_never_shrink(base_ms in 1u64..10_000, attempts in 1u32..40) {
            let policy = RetryPolicy::exponential(Duration::from_millis(base_ms));
            prop_assert!(policy.delay_for(attempts + 1) >= policy.delay_for(attempts));
        }

        #[test]
        fn same_input_same_decision(attempts in 0u32..20, max_attempts in 0u32..20) {
            let policy = RetryPolicy::default();
            prop_assert_eq!(policy.decide(attempts, max_attempts), policy.decide(attempts, max_attempts));
        }
    }
}
