//! Time utilities

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in milliseconds, 0 if the clock is before the epoch
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Elapsed time since a millisecond timestamp.
///
/// Returns Duration::ZERO if the given time is in the future.
pub fn elapsed_since(since_millis: u64) -> Duration {
    Duration::from_millis(current_time_millis().saturating_sub(since_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_time_millis_is_positive() {
        assert!(current_time_millis() > 0);
    }

    #[test]
    fn test_elapsed_since_future_time() {
        let future = current_time_millis() + 1_000_000;
        assert_eq!(elapsed_since(future), Duration::ZERO);
    }
}
