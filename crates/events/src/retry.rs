use crate::ConsumerGroupConfig;

use std::time::Duration;

/// What to do after a failed delivery attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Deliver again after the given delay.
    Retry(Duration),

    /// Delivery attempts are used up; the message goes to the dead-letter
    /// target (or is dropped when there is none).
    Exhausted,
}

/// Redelivery policy shared by both drivers.
///
/// Attempts are 1-based. The delay after attempt `n` is `backoff[n - 1]`,
/// repeating the last entry, or `ack_wait` when no schedule is configured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    ack_wait: Duration,
    backoff: Vec<Duration>,
    max_deliver: u32,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_deliver: u32, ack_wait: Duration, backoff: Vec<Duration>) -> Self {
        Self {
            ack_wait,
            backoff,
            max_deliver: max_deliver.max(1),
        }
    }

    /// Total attempts allowed.
    #[must_use]
    pub const fn max_deliver(&self) -> u32 {
        self.max_deliver
    }

    /// Delay before the attempt following `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);

        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(self.ack_wait)
    }

    /// Whether `attempt` was the last one allowed.
    #[must_use]
    pub const fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_deliver
    }

    /// Decision after `attempt` failed.
    #[must_use]
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        if self.is_exhausted(attempt) {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry(self.delay(attempt))
        }
    }

    /// Upper bound on the time a message spends in retry sleeps.
    #[must_use]
    pub fn retry_window(&self) -> Duration {
        (1..self.max_deliver).map(|attempt| self.delay(attempt)).sum()
    }
}

impl From<&ConsumerGroupConfig> for RetryPolicy {
    fn from(config: &ConsumerGroupConfig) -> Self {
        Self::new(config.max_deliver, config.ack_wait, config.backoff.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_interval_without_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1), Vec::new());

        assert_eq!(policy.decide(1), RetryDecision::Retry(Duration::from_secs(1)));
        assert_eq!(policy.decide(2), RetryDecision::Retry(Duration::from_secs(1)));
        assert_eq!(policy.decide(3), RetryDecision::Exhausted);
        assert_eq!(policy.retry_window(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_schedule_repeats_last_entry() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_secs(30),
            vec![Duration::from_millis(100), Duration::from_millis(400)],
        );

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(400));
        assert_eq!(policy.retry_window(), Duration::from_millis(1300));
    }

    #[test]
    fn test_single_attempt_is_exhausted_immediately() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1), Vec::new());

        assert_eq!(policy.decide(1), RetryDecision::Exhausted);
        assert_eq!(policy.retry_window(), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let config = ConsumerGroupConfig::for_group("billing")
            .with_max_deliver(4)
            .with_ack_wait(Duration::from_millis(250));

        let policy = RetryPolicy::from(&config);

        assert_eq!(policy.max_deliver(), 4);
        assert_eq!(policy.delay(3), Duration::from_millis(250));
    }
}
