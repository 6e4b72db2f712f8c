//! Retry backoff policy for publish attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy for transient publish failures.
///
/// Multiplicative backoff, capped; exhaustion is reported to the caller and
/// logged, never escalated into a run failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial delay between attempts in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            use_jitter: default_true(),
        }
    }
}

impl BackoffPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` tries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Delay before retry number `attempt` (0-indexed), capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let delay_ms = base.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter {
            // Up to 25% jitter.
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.max_delay_ms, 10_000);
    }

    #[test]
    fn test_should_retry() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!BackoffPolicy::no_retry().should_retry(0));
    }

    #[test]
    fn test_multiplicative_backoff_capped() {
        let policy = BackoffPolicy {
            max_attempts: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            use_jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
        // Capped at 10s from attempt 4 on.
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(10_000));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(10_000));
    }
}
