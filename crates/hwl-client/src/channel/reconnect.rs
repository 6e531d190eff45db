//! Exponential backoff for connection retries

use std::time::Duration;

use hwl_core::config::BackoffConfig;

/// Exponential backoff with jitter and an optional attempt budget
pub struct ExponentialBackoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempts: 0,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts += 1;
        if self.max_attempts.is_some_and(|max| self.attempts >= max) {
            return None;
        }

        let delay = self.current;
        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        Some(delay + Duration::from_secs_f64(jitter_amount))
    }

    /// Failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(initial),
            max: Duration::from_secs(max),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_backoff_increases_and_caps() {
        let mut backoff = ExponentialBackoff::from_config(&config(1, 4, None));

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_backoff_budget() {
        let mut backoff = ExponentialBackoff::from_config(&config(1, 60, Some(3)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }
}
