//! Exponential backoff for reconnection

use std::time::Duration;

use tl_core::config::{BackoffConfig, TransportConfig};

/// Exponential backoff with optional jitter for reconnection attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay handed out by the next call
    current: Duration,
    /// First delay, restored by `reset`
    initial: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            current: initial,
            initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = std::cmp::min(self.current, self.max);

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Bounds for `connect_and_run`'s reconnection loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failed attempts before giving up (None = forever)
    pub max_retries: Option<u32>,
    pub backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff.clone(),
        }
    }

    /// Plain doubling from `initial` up to `max`, without jitter
    pub fn doubling(max_retries: Option<u32>, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffConfig {
                initial,
                max,
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    pub(crate) fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::from_config(&self.backoff)
    }

    /// Whether `failures` consecutive failed attempts exhaust the policy
    pub(crate) fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0, // No jitter for deterministic test
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60)); // Capped at max
        assert_eq!(backoff.next_delay(), Duration::from_secs(60)); // Still capped
    }

    #[test]
    fn test_kth_wait_matches_closed_form() {
        let b0 = Duration::from_millis(100);
        let bmax = Duration::from_millis(1_000);
        let mut backoff = RetryPolicy::doubling(None, b0, bmax).new_backoff();

        for k in 1..=8u32 {
            let expected = std::cmp::min(b0 * 2u32.pow(k - 1), bmax);
            assert_eq!(backoff.next_delay(), expected, "wait #{}", k);
        }
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0, 0.5);
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1_500));
    }

    #[test]
    fn test_exhausted() {
        let finite = RetryPolicy::doubling(Some(3), Duration::ZERO, Duration::ZERO);
        assert!(!finite.exhausted(2));
        assert!(finite.exhausted(3));

        let forever = RetryPolicy::doubling(None, Duration::ZERO, Duration::ZERO);
        assert!(!forever.exhausted(u32::MAX));
    }
}
