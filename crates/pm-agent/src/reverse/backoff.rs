//! Exponential backoff for reconnection

use std::time::Duration;

use pm_core::config::BackoffConfig;

/// Exponential backoff with jitter for reconnection attempts
pub struct ExponentialBackoff {
    /// Delay returned by the next call
    current: Duration,
    /// Delay to return to on reset
    initial: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0), applied as ± around the base delay
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
        let base = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        // jitter spreads reconnects of many agents apart
        let spread = base.as_secs_f64() * self.jitter * (2.0 * rand::random::<f64>() - 1.0);
        Duration::from_secs_f64((base.as_secs_f64() + spread).max(0.0))
    }

    /// Reset the backoff to the initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(2),
            Duration::from_secs(60),
            2.0,
            0.0, // No jitter for deterministic test
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_monotonic_until_cap() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 2.0, 0.0);

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(delay <= Duration::from_secs(60));
            last = delay;
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(8), Duration::from_secs(60), 2.0, 0.25);

        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(6));
        assert!(delay <= Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 2.0, 0.0);

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }
}
