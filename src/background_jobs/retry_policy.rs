//! Retry policy for failed scheduled jobs.
//!
//! Implements exponential backoff with configurable parameters.

use crate::config::RetrySettings;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Consecutive failures after which the job falls back to its regular interval.
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    /// Cap for exponential growth.
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_secs: settings.initial_backoff_secs,
            max_backoff_secs: settings.max_backoff_secs,
            backoff_multiplier: settings.backoff_multiplier,
        }
    }

    /// A policy that never retries early.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Whether a job with `consecutive_failures` failures in a row is still
    /// eligible for an early retry.
    pub fn should_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures > 0 && consecutive_failures <= self.max_retries
    }

    /// Backoff before retry number `retry_count` (zero-based):
    /// `initial_backoff * multiplier^retry_count`, capped at `max_backoff_secs`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let backoff = self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_secs(backoff.min(self.max_backoff_secs as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 60,
            max_backoff_secs: 3600,
            backoff_multiplier: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_from_settings() {
        let settings = RetrySettings {
            max_retries: 5,
            initial_backoff_secs: 10,
            max_backoff_secs: 600,
            backoff_multiplier: 3.0,
        };
        let policy = RetryPolicy::new(&settings);

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_backoff_secs, 10);
        assert_eq!(policy.max_backoff_secs, 600);
        assert_eq!(policy.backoff_multiplier, 3.0);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::from_secs(60));
        assert_eq!(policy.backoff(1), Duration::from_secs(120));
        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        assert_eq!(policy.backoff(3), Duration::from_secs(480));
    }

    #[test]
    fn test_backoff_capping() {
        let policy = RetryPolicy {
            max_backoff_secs: 300,
            ..Default::default()
        };

        assert_eq!(policy.backoff(2), Duration::from_secs(240));
        // 60 * 2^3 = 480 -> capped
        assert_eq!(policy.backoff(3), Duration::from_secs(300));
        assert_eq!(policy.backoff(40), Duration::from_secs(300));
    }

    #[test]
    fn test_should_retry_bounds() {
        let policy = RetryPolicy::default();

        assert!(!policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn test_disabled_policy_never_retries() {
        let policy = RetryPolicy::disabled();
        assert!(!policy.should_retry(1));
    }
}
