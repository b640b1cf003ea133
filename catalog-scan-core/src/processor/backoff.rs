use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Attempts made so far, counting the current one. The dequeue count keeps
/// rising even when a stored attempt count failed to persist.
pub fn total_attempts(attempt_count: u32, dequeue_count: u32) -> u32 {
    attempt_count.saturating_add(1).max(dequeue_count)
}

/// Randomised wait before leaf attempt `attempt` may run again.
///
/// Attempt 1 waits within `[0, first_attempt_max)`; attempt `n` waits within
/// `[(n-1)*increment, n*increment)`.
pub fn leaf_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let (low, high) = leaf_delay_band(config, attempt);
    if high <= low {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rand::rng().random_range(low..high))
}

/// Inclusive-exclusive band in milliseconds for [`leaf_delay`].
pub fn leaf_delay_band(config: &BackoffConfig, attempt: u32) -> (u64, u64) {
    if attempt <= 1 {
        return (0, config.first_attempt_max_ms);
    }
    let n = u64::from(attempt);
    (
        (n - 1).saturating_mul(config.increment_ms),
        n.saturating_mul(config.increment_ms),
    )
}

/// Delay for an index message polling its own progress.
pub fn requeue_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let secs = u64::from(attempt)
        .saturating_mul(config.requeue_factor_secs)
        .min(config.requeue_max_secs);
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_fall_within_their_band() {
        let config = BackoffConfig::default();
        for attempt in 0..=12 {
            let (low, high) = leaf_delay_band(&config, attempt);
            for _ in 0..50 {
                let delay = leaf_delay(&config, attempt).as_millis() as u64;
                assert!(
                    (low..high).contains(&delay),
                    "attempt {attempt}: {delay} outside [{low}, {high})"
                );
            }
        }
        assert_eq!(leaf_delay_band(&config, 1), (0, 60_000));
        assert_eq!(leaf_delay_band(&config, 2), (120_000, 240_000));
        assert_eq!(leaf_delay_band(&config, 3), (240_000, 360_000));
    }

    #[test]
    fn total_attempts_prefers_the_larger_count() {
        assert_eq!(total_attempts(0, 1), 1);
        assert_eq!(total_attempts(4, 1), 5);
        assert_eq!(total_attempts(2, 9), 9);
    }

    #[test]
    fn counted_attempts_pick_the_band() {
        let config = BackoffConfig::default();
        // A first attempt is counted before its delay is chosen.
        assert_eq!(
            leaf_delay_band(&config, total_attempts(1, 1)),
            (120_000, 240_000)
        );
        assert_eq!(
            leaf_delay_band(&config, total_attempts(2, 2)),
            (240_000, 360_000)
        );
        assert_eq!(
            leaf_delay_band(&config, total_attempts(1, 5)),
            (480_000, 600_000)
        );
    }

    #[test]
    fn requeue_delay_is_capped() {
        let config = BackoffConfig::default();
        assert_eq!(requeue_delay(&config, 0), Duration::ZERO);
        assert_eq!(requeue_delay(&config, 5), Duration::from_secs(5));
        assert_eq!(requeue_delay(&config, 61), Duration::from_secs(60));
    }
}
