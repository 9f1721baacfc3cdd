//! Engine error taxonomy.
//!
//! Validation gates return these errors as values; storage failures arrive
//! as [`EngineError::Storage`] inside a unit of work and are classified and
//! rewrapped by the transaction coordinator, so callers of the engine only
//! ever observe the typed variants below.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimitTier;
use crate::store::StoreError;

/// Why an actor may not act on a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum AuthorizationReason {
    /// The caller layer did not authenticate the actor.
    NotAuthenticated,
    /// The actor owns the entity under approval.
    SelfApproval,
    /// The actor lacks the step's role and holds no delegation or escalation
    /// grant for it.
    MissingRole {
        /// Role the step requires.
        required_role: String,
    },
    /// The step requires a multi-factor-verified session.
    MfaRequired,
    /// The actor may not delegate or escalate this step.
    NotPermitted {
        /// What was refused.
        detail: String,
    },
}

impl fmt::Display for AuthorizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthenticated => write!(f, "actor is not authenticated"),
            Self::SelfApproval => write!(f, "actors may not approve their own entities"),
            Self::MissingRole { required_role } => {
                write!(f, "actor lacks required role '{required_role}'")
            }
            Self::MfaRequired => write!(f, "step requires multi-factor verification"),
            Self::NotPermitted { detail } => write!(f, "{detail}"),
        }
    }
}

/// Error kinds reported to callers alongside failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input or inconsistent workflow state.
    Validation,
    /// Role, self-approval or MFA refusal.
    Authorization,
    /// The actor already voted on the step.
    DuplicateApproval,
    /// Admission control refused the request.
    RateLimit,
    /// A concurrent writer changed the instance.
    OptimisticLock,
    /// Lock contention persisted through every retry.
    Deadlock,
    /// No pooled connection became available in time.
    ConnectionPoolExhaustion,
    /// A connection could not be established or failed its health check.
    ConnectionTimeout,
    /// The unit of work exceeded its wall-clock ceiling.
    TransactionTimeout,
    /// The storage layer failed terminally.
    Transaction,
    /// The referenced instance or definition does not exist.
    NotFound,
}

impl ErrorKind {
    /// Stable identifier for logs and wire formats.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Authorization => "authorization_error",
            Self::DuplicateApproval => "duplicate_approval_error",
            Self::RateLimit => "rate_limit_error",
            Self::OptimisticLock => "optimistic_lock_error",
            Self::Deadlock => "deadlock_error",
            Self::ConnectionPoolExhaustion => "connection_pool_exhaustion_error",
            Self::ConnectionTimeout => "connection_timeout_error",
            Self::TransactionTimeout => "transaction_timeout_error",
            Self::Transaction => "transaction_error",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the approval engine and its components.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input or inconsistent workflow state. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The actor may not perform the action. Never retried.
    #[error("actor '{actor_id}' not authorized: {reason}")]
    Authorization {
        /// Acting user.
        actor_id: String,
        /// Refusal reason.
        reason: AuthorizationReason,
    },

    /// The actor already voted on the step. Never retried.
    #[error("actor '{actor_id}' already voted on step {step}")]
    DuplicateApproval {
        /// Acting user (or the delegator they act for).
        actor_id: String,
        /// Step index.
        step: usize,
    },

    /// Admission control refused the request. The caller may retry later.
    #[error("rate limit exceeded on {tier} tier; retry after {retry_after:?}")]
    RateLimited {
        /// Tier that refused.
        tier: RateLimitTier,
        /// Earliest time a retry can succeed.
        retry_after: Duration,
    },

    /// A concurrent writer changed the instance.
    #[error("optimistic lock conflict on {entity} after {attempts} attempt(s): {detail}")]
    OptimisticLock {
        /// Entity key.
        entity: String,
        /// Attempts made before surfacing.
        attempts: u32,
        /// Observed versions or store detail.
        detail: String,
    },

    /// Deadlock-like failures persisted through every retry.
    #[error("deadlock in {operation} persisted through {attempts} attempt(s)")]
    Deadlock {
        /// Unit of work name.
        operation: String,
        /// Entity key, when known.
        entity: Option<String>,
        /// Attempts made.
        attempts: u32,
        /// Last storage failure.
        #[source]
        source: StoreError,
    },

    /// No pooled connection became available in time.
    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted {
        /// Time spent waiting.
        waited: Duration,
    },

    /// A connection could not be established or failed its health check.
    #[error("connection unavailable: {0}")]
    ConnectionTimeout(String),

    /// The unit of work exceeded its wall-clock ceiling and was rolled back.
    #[error("transaction {operation} exceeded {timeout:?} after {attempts} attempt(s)")]
    TransactionTimeout {
        /// Unit of work name.
        operation: String,
        /// Configured ceiling.
        timeout: Duration,
        /// Attempts started.
        attempts: u32,
    },

    /// The storage layer failed terminally.
    #[error("transaction {operation} failed after {attempts} attempt(s)")]
    Transaction {
        /// Unit of work name.
        operation: String,
        /// Entity key, when known.
        entity: Option<String>,
        /// Attempts made.
        attempts: u32,
        /// Underlying storage failure.
        #[source]
        source: StoreError,
    },

    /// The referenced instance or definition does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Raw storage failure raised inside a unit of work.
    ///
    /// The transaction coordinator classifies and rewraps this variant; it
    /// does not escape to engine callers.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl EngineError {
    /// Convenience constructor for validation failures.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Convenience constructor for authorization failures.
    pub fn unauthorized(actor_id: impl Into<String>, reason: AuthorizationReason) -> Self {
        Self::Authorization {
            actor_id: actor_id.into(),
            reason,
        }
    }

    /// The kind reported to callers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::DuplicateApproval { .. } => ErrorKind::DuplicateApproval,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::OptimisticLock { .. } => ErrorKind::OptimisticLock,
            Self::Deadlock { .. } => ErrorKind::Deadlock,
            Self::PoolExhausted { .. } => ErrorKind::ConnectionPoolExhaustion,
            Self::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            Self::TransactionTimeout { .. } => ErrorKind::TransactionTimeout,
            Self::Transaction { .. } | Self::Storage(_) => ErrorKind::Transaction,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    /// Whether the caller may reasonably try again later. The engine has
    /// already spent its own retry budget on these.
    ///
    /// This is the caller-facing contract; what the transaction coordinator
    /// retries internally is decided by
    /// [`FailureClass`](crate::transaction::FailureClass).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::OptimisticLock { .. }
            | Self::Deadlock { .. }
            | Self::PoolExhausted { .. }
            | Self::ConnectionTimeout(_)
            | Self::TransactionTimeout { .. } => true,
            Self::Storage(source) => source.kind.is_deadlock_like(),
            Self::Validation(_)
            | Self::Authorization { .. }
            | Self::DuplicateApproval { .. }
            | Self::Transaction { .. }
            | Self::NotFound(_) => false,
        }
    }

    /// Generic message safe to show end users.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message) => format!("The request is not valid: {message}"),
            Self::Authorization { reason, .. } => match reason {
                AuthorizationReason::SelfApproval => {
                    "You cannot approve a record you created.".to_string()
                }
                AuthorizationReason::MfaRequired => {
                    "This step requires multi-factor verification.".to_string()
                }
                _ => "You are not permitted to perform this action.".to_string(),
            },
            Self::DuplicateApproval { .. } => "You have already acted on this step.".to_string(),
            Self::RateLimited { retry_after, .. } => format!(
                "Too many approval attempts. Try again in {} seconds.",
                retry_after.as_secs().max(1)
            ),
            Self::OptimisticLock { .. } => {
                "The record was changed by someone else. Reload and try again.".to_string()
            }
            Self::NotFound(_) => "The requested workflow does not exist.".to_string(),
            Self::Deadlock { .. }
            | Self::PoolExhausted { .. }
            | Self::ConnectionTimeout(_)
            | Self::TransactionTimeout { .. }
            | Self::Transaction { .. }
            | Self::Storage(_) => {
                "The approval service is busy. Please try again shortly.".to_string()
            }
        }
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreErrorKind;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngineError::validation("bad step").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::unauthorized("alice", AuthorizationReason::SelfApproval).kind(),
            ErrorKind::Authorization
        );
        let raw = StoreError::new(StoreErrorKind::Corrupt, "read", "bad json");
        assert_eq!(EngineError::from(raw).kind(), ErrorKind::Transaction);
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = EngineError::Transaction {
            operation: "approve".to_string(),
            entity: Some("invoice/42".to_string()),
            attempts: 1,
            source: StoreError::new(StoreErrorKind::Other, "write", "disk I/O error at page 7"),
        };
        let message = err.user_message();
        assert!(!message.contains("disk"));
        assert!(!message.contains("invoice"));
    }

    #[test]
    fn test_retryable_split() {
        assert!(!EngineError::validation("x").is_retryable());
        assert!(
            !EngineError::DuplicateApproval {
                actor_id: "bob".to_string(),
                step: 0,
            }
            .is_retryable()
        );
        assert!(
            EngineError::PoolExhausted {
                waited: Duration::from_secs(1),
            }
            .is_retryable()
        );
        let busy = StoreError::new(StoreErrorKind::Busy, "lock_instance", "database is locked");
        assert!(EngineError::from(busy).is_retryable());
    }

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(ErrorKind::DuplicateApproval.as_str(), "duplicate_approval_error");
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit_error");
    }
}
