//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides standard
//! backoff configurations for sequence-conflict retries, payout rail calls,
//! and outbound HTTP requests.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::{RetryConfig, WithdrawalConfig};

/// Backoff for optimistic-concurrency retries (sequence conflicts).
///
/// Conflicts resolve as soon as the competing writer commits, so delays are
/// short and attempts are many.
pub fn conflict_backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_attempts)
        .with_jitter()
}

/// Backoff for payout rail disbursement.
///
/// `rail_max_attempts` counts the first call, so retries are one fewer.
pub fn rail_backoff(config: &WithdrawalConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.rail_min_delay_ms))
        .with_max_delay(Duration::from_millis(config.rail_max_delay_ms))
        .with_max_times(config.rail_max_attempts.saturating_sub(1))
        .with_jitter()
}

/// Backoff for outbound HTTP requests.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 3
/// - Jitter enabled
pub fn http_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(3)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use backon::BackoffBuilder;

    use super::*;

    #[test]
    fn test_conflict_backoff_respects_max_attempts() {
        let config = RetryConfig {
            min_delay_ms: 1,
            max_delay_ms: 4,
            max_attempts: 5,
        };
        let delays: Vec<Duration> = conflict_backoff(&config).build().collect();
        assert_eq!(delays.len(), 5);
        // Jitter adds at most one extra min-delay on top of the cap
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(8)));
    }

    #[test]
    fn test_rail_backoff_counts_first_attempt() {
        let config = WithdrawalConfig {
            rail_max_attempts: 3,
            rail_min_delay_ms: 1,
            rail_max_delay_ms: 2,
            ..WithdrawalConfig::default()
        };
        assert_eq!(rail_backoff(&config).build().count(), 2);

        let single = WithdrawalConfig {
            rail_max_attempts: 1,
            ..config
        };
        assert_eq!(rail_backoff(&single).build().count(), 0);
    }
}
