//! ABOUTME: Retry policy with exponential backoff for workflow steps and agents
//! ABOUTME: Delay computation is capped at max_delay with optional upward jitter

use crate::error::{AiShellError, ErrorKind, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Retry policy attached to a workflow step or agent operation.
///
/// A failed attempt is retried only when its error kind is a member of
/// `retry_on`. The i-th retry sleeps
/// `min(initial_delay * backoff_multiplier^(i-1), max_delay)`.
///
/// # Examples
///
/// ```
/// use aishell_core::{ErrorKind, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(3)
///     .with_initial_delay(Duration::from_millis(10))
///     .with_backoff_multiplier(2.0)
///     .retry_on(ErrorKind::Transient);
///
/// assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
/// assert!(policy.should_retry(ErrorKind::Transient, 1));
/// assert!(!policy.should_retry(ErrorKind::Transient, 3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempt cap, including the first run
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_initial_delay")]
    pub initial_delay: Duration,
    /// Multiplier applied per retry
    #[serde(default = "default_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay: Duration,
    /// Error kinds eligible for retry; empty means nothing is retried
    #[serde(default)]
    pub retry_on: HashSet<ErrorKind>,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            retry_on: [ErrorKind::Transient].into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            retry_on: HashSet::new(),
            ..Self::default()
        }
    }

    /// Create a policy with the given attempt cap and defaults elsewhere
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retry_on: HashSet::new(),
            ..Self::default()
        }
    }

    /// Set the delay before the first retry
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the per-retry multiplier
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set the delay cap
    #[must_use]
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Add an error kind to the retryable set
    #[must_use]
    pub fn retry_on(mut self, kind: ErrorKind) -> Self {
        self.retry_on.insert(kind);
        self
    }

    /// Validate policy bounds; called during workflow registration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AiShellError::InvalidWorkflow {
                message: "retry policy max_attempts must be at least 1".to_string(),
            });
        }
        if self.backoff_multiplier < 1.0 {
            return Err(AiShellError::InvalidWorkflow {
                message: format!(
                    "retry policy backoff_multiplier must be >= 1.0, got {}",
                    self.backoff_multiplier
                ),
            });
        }
        if self.max_delay < self.initial_delay {
            return Err(AiShellError::InvalidWorkflow {
                message: "retry policy max_delay must be >= initial_delay".to_string(),
            });
        }
        Ok(())
    }

    /// Whether a failure of `kind` on `attempt` (1-based) warrants a retry
    #[must_use]
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        attempt < self.max_attempts && self.retry_on.contains(&kind)
    }

    /// Backoff delay before retrying after `attempt` (1-based) failed
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = self.backoff_multiplier.powi(exponent as i32);
        let raw = self.initial_delay.as_secs_f64() * factor;
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff delay with up to 10% upward jitter, still capped at max_delay
    #[must_use]
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        let with_jitter = base.as_secs_f64() * (1.0 + jitter);
        Duration::from_secs_f64(with_jitter.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::new(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(50));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
        // Capped at max_delay
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(50));
    }

    #[test]
    fn test_should_retry_respects_kind_and_cap() {
        let policy = RetryPolicy::new(3).retry_on(ErrorKind::Transient);
        assert!(policy.should_retry(ErrorKind::Transient, 1));
        assert!(policy.should_retry(ErrorKind::Transient, 2));
        assert!(!policy.should_retry(ErrorKind::Transient, 3));
        assert!(!policy.should_retry(ErrorKind::Timeout, 1));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = RetryPolicy::new(1).retry_on(ErrorKind::Transient);
        assert!(!policy.should_retry(ErrorKind::Transient, 1));
    }

    #[test]
    fn test_validation_rejects_bad_bounds() {
        assert!(RetryPolicy::new(0).validate().is_err());
        assert!(RetryPolicy::new(3)
            .with_backoff_multiplier(0.5)
            .validate()
            .is_err());
        assert!(RetryPolicy::new(3)
            .with_initial_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    proptest! {
        /// delay_i satisfies min(initial * multiplier^(i-1), max) <= delay_i <= max
        #[test]
        fn prop_delay_within_bounds(
            initial_ms in 1u64..1000,
            multiplier in 1.0f64..4.0,
            max_ms in 1000u64..60_000,
            attempt in 1u32..16,
        ) {
            let policy = RetryPolicy::new(20)
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_backoff_multiplier(multiplier)
                .with_max_delay(Duration::from_millis(max_ms));

            let delay = policy.delay_for_attempt(attempt);
            let base = (initial_ms as f64) * multiplier.powi((attempt - 1) as i32);
            let expected = base.min(max_ms as f64);

            let delay_ms = delay.as_secs_f64() * 1000.0;
            prop_assert!((delay_ms - expected).abs() < 1.0);
            prop_assert!(delay_ms <= max_ms as f64 + 1.0);
        }

        /// Jitter never pushes a delay past max_delay or below the base delay
        #[test]
        fn prop_jitter_stays_bounded(attempt in 1u32..10) {
            let policy = RetryPolicy::new(20)
                .with_initial_delay(Duration::from_millis(10))
                .with_backoff_multiplier(2.0)
                .with_max_delay(Duration::from_millis(200));

            let base = policy.delay_for_attempt(attempt);
            let jittered = policy.jittered_delay_for_attempt(attempt);
            prop_assert!(jittered >= base || jittered == policy.max_delay);
            prop_assert!(jittered <= policy.max_delay.max(base));
        }
    }
}
