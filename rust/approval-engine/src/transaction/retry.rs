//! Failure classification and backoff for the transaction coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::TransactionConfig;
use crate::error::EngineError;
use crate::store::StoreErrorKind;

/// Growth of the delay between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^(n-1)`.
    #[default]
    Exponential,
    /// `base * n`.
    Linear,
}

/// How the coordinator treats a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Lock contention or a dropped connection. Retried up to
    /// `deadlock_retry_attempts` times.
    DeadlockLike,
    /// A versioned write lost a race. Retried up to `max_retries` times.
    OptimisticConflict,
    /// Storage failure that will not go away on retry.
    Terminal,
    /// Validation, authorization and other engine errors raised by the unit
    /// of work. Passed through untouched.
    Domain,
}

impl FailureClass {
    /// Classify an error returned by a unit of work.
    #[must_use]
    pub fn classify(error: &EngineError) -> Self {
        match error {
            EngineError::Storage(store) if store.kind.is_deadlock_like() => Self::DeadlockLike,
            EngineError::Storage(store) if store.kind == StoreErrorKind::VersionConflict => {
                Self::OptimisticConflict
            }
            EngineError::Storage(_) => Self::Terminal,
            _ => Self::Domain,
        }
    }

    /// Whether the coordinator may retry this class.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeadlockLike | Self::OptimisticConflict)
    }
}

/// Retry budgets and backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries for optimistic conflicts.
    pub max_retries: u32,
    /// Retries for deadlock-like failures.
    pub deadlock_retry_attempts: u32,
    /// First retry delay.
    pub base_delay: Duration,
    /// Delay ceiling.
    pub max_delay: Duration,
    /// Delay growth.
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransactionConfig::default())
    }
}

impl RetryPolicy {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &TransactionConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            deadlock_retry_attempts: config.deadlock_retry_attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            strategy: config.backoff,
        }
    }

    /// Retry budget for a failure class.
    #[must_use]
    pub const fn budget(&self, class: FailureClass) -> u32 {
        match class {
            FailureClass::DeadlockLike => self.deadlock_retry_attempts,
            FailureClass::OptimisticConflict => self.max_retries,
            FailureClass::Terminal | FailureClass::Domain => 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = 1_u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
        };
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthorizationReason;
    use crate::store::StoreError;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            deadlock_retry_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            strategy,
        }
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = policy(BackoffStrategy::Exponential);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(64), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_delay_capped() {
        let policy = policy(BackoffStrategy::Linear);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(300));
        assert_eq!(policy.delay(20), Duration::from_millis(1000));
    }

    #[test]
    fn test_classification() {
        let storage = |kind| EngineError::Storage(StoreError::new(kind, "write", "x"));
        assert_eq!(
            FailureClass::classify(&storage(StoreErrorKind::Deadlock)),
            FailureClass::DeadlockLike
        );
        assert_eq!(
            FailureClass::classify(&storage(StoreErrorKind::Busy)),
            FailureClass::DeadlockLike
        );
        assert_eq!(
            FailureClass::classify(&storage(StoreErrorKind::VersionConflict)),
            FailureClass::OptimisticConflict
        );
        assert_eq!(
            FailureClass::classify(&storage(StoreErrorKind::Corrupt)),
            FailureClass::Terminal
        );
        assert_eq!(
            FailureClass::classify(&EngineError::unauthorized(
                "a",
                AuthorizationReason::SelfApproval
            )),
            FailureClass::Domain
        );
        assert!(FailureClass::classify(&storage(StoreErrorKind::LockTimeout)).is_retryable());
        assert!(!FailureClass::classify(&EngineError::validation("bad")).is_retryable());
    }

    #[test]
    fn test_coordinator_retry_is_narrower_than_caller_retry() {
        // Rate limits are worth retrying later, but never inside a transaction.
        let limited = EngineError::RateLimited {
            tier: crate::rate_limit::RateLimitTier::Burst,
            retry_after: Duration::from_secs(10),
        };
        assert!(limited.is_retryable());
        assert_eq!(FailureClass::classify(&limited), FailureClass::Domain);
        assert!(!FailureClass::classify(&limited).is_retryable());
    }

    #[test]
    fn test_budgets() {
        let policy = policy(BackoffStrategy::Exponential);
        assert_eq!(policy.budget(FailureClass::DeadlockLike), 5);
        assert_eq!(policy.budget(FailureClass::OptimisticConflict), 3);
        assert_eq!(policy.budget(FailureClass::Terminal), 0);
    }
}
