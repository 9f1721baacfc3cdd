//! Persistent-store interface consumed by the engine.
//!
//! A store hands out connections through a [`ConnectionFactory`]; each
//! [`StoreConnection`] offers begin/commit/rollback, a pessimistic row lock,
//! versioned writes and an audit append. Adapters classify their native
//! failures into [`StoreErrorKind`] so the transaction coordinator can decide
//! on retries by matching the kind, never the message.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{EntityKey, SecurityEvent, WorkflowInstance};

pub use memory::{MemoryConnection, MemoryStore};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqliteStore};

/// Classification of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Mutual lock contention detected by the engine.
    Deadlock,
    /// A row lock could not be obtained within the lock-wait timeout.
    LockTimeout,
    /// The connection dropped mid-operation.
    Disconnected,
    /// The database is temporarily busy.
    Busy,
    /// A versioned write found a different stored version.
    VersionConflict,
    /// The row does not exist.
    NotFound,
    /// An insert found an existing row.
    AlreadyExists,
    /// Stored data could not be decoded.
    Corrupt,
    /// Anything else.
    Other,
}

impl StoreErrorKind {
    /// Transient lock or connection trouble worth retrying.
    #[must_use]
    pub const fn is_deadlock_like(&self) -> bool {
        matches!(
            self,
            Self::Deadlock | Self::LockTimeout | Self::Disconnected | Self::Busy
        )
    }

    /// Storage string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deadlock => "deadlock",
            Self::LockTimeout => "lock_timeout",
            Self::Disconnected => "disconnected",
            Self::Busy => "busy",
            Self::VersionConflict => "version_conflict",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Corrupt => "corrupt",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified storage failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct StoreError {
    /// Classification.
    pub kind: StoreErrorKind,
    /// Store operation that failed.
    pub operation: &'static str,
    /// Adapter detail. Never shown to end users.
    pub message: String,
}

impl StoreError {
    /// Create an error.
    pub fn new(kind: StoreErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    /// Row-not-found error for `key`.
    #[must_use]
    pub fn not_found(operation: &'static str, key: &EntityKey) -> Self {
        Self::new(StoreErrorKind::NotFound, operation, format!("no row for {key}"))
    }

    /// Error raised when a mutation is attempted outside a transaction.
    #[must_use]
    pub fn no_transaction(operation: &'static str) -> Self {
        Self::new(StoreErrorKind::Other, operation, "no active transaction")
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Each statement sees committed data as of its start.
    #[default]
    ReadCommitted,
    /// Reads within a transaction are repeatable.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        })
    }
}

/// One connection to the persistent store.
///
/// Mutations (`lock_row`, `insert`, `write`, `append_audit`) require an open
/// transaction. Their effects become visible to other connections at
/// `commit` and are discarded by `rollback`.
#[async_trait]
pub trait StoreConnection: Send + 'static {
    /// Trivial round trip used by pool health checks.
    async fn ping(&mut self) -> StoreResult<()>;

    /// Open a transaction.
    async fn begin(&mut self, isolation: IsolationLevel) -> StoreResult<()>;

    /// Commit the open transaction.
    async fn commit(&mut self) -> StoreResult<()>;

    /// Roll back the open transaction. A no-op without one.
    async fn rollback(&mut self) -> StoreResult<()>;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Lock the row for `key` until the transaction ends and return its
    /// current contents.
    async fn lock_row(&mut self, key: &EntityKey) -> StoreResult<WorkflowInstance>;

    /// Read the row for `key` without locking it.
    async fn read(&mut self, key: &EntityKey) -> StoreResult<Option<WorkflowInstance>>;

    /// Insert a new row. Fails with `AlreadyExists` when the key is taken.
    async fn insert(&mut self, instance: &WorkflowInstance) -> StoreResult<()>;

    /// Versioned write: succeeds only if the stored version equals
    /// `instance.version - 1`, otherwise fails with `VersionConflict`.
    async fn write(&mut self, instance: &WorkflowInstance) -> StoreResult<()>;

    /// Append an audit row.
    async fn append_audit(&mut self, event: &SecurityEvent) -> StoreResult<()>;
}

/// Opens new store connections for the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Connection type produced.
    type Connection: StoreConnection;

    /// Open a new connection.
    async fn connect(&self) -> StoreResult<Self::Connection>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_like_kinds() {
        assert!(StoreErrorKind::Deadlock.is_deadlock_like());
        assert!(StoreErrorKind::LockTimeout.is_deadlock_like());
        assert!(StoreErrorKind::Disconnected.is_deadlock_like());
        assert!(StoreErrorKind::Busy.is_deadlock_like());
        assert!(!StoreErrorKind::VersionConflict.is_deadlock_like());
        assert!(!StoreErrorKind::Corrupt.is_deadlock_like());
    }

    #[test]
    fn test_isolation_level_serde() {
        let level: IsolationLevel = serde_json::from_str("\"serializable\"").unwrap();
        assert_eq!(level, IsolationLevel::Serializable);
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::new(StoreErrorKind::Busy, "write", "database is locked");
        assert_eq!(err.to_string(), "write failed (busy): database is locked");
    }
}
