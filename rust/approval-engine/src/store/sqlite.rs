//! `SQLite` backend for workflow instances and the audit trail.
//!
//! Each [`SqliteConnection`] owns one `rusqlite::Connection` and runs every
//! statement on the blocking thread pool. The database runs in WAL mode with
//! a busy timeout, so lock contention surfaces as `SQLITE_BUSY` and is mapped
//! to [`StoreErrorKind::Busy`] for the transaction coordinator to retry.
//!
//! `SQLite` locks the whole database for writing, so the row lock is emulated
//! by a no-op `UPDATE` on the row: it takes the write lock and holds it until
//! the transaction ends.
//!
//! ```rust,ignore
//! let store = SqliteStore::open("./approvals.db", Duration::from_secs(5)).await?;
//! let mut conn = store.connect().await?;
//! conn.begin(IsolationLevel::Serializable).await?;
//! let instance = conn.lock_row(&key).await?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use tokio::task;
use uuid::Uuid;

use super::{
    ConnectionFactory, IsolationLevel, StoreConnection, StoreError, StoreErrorKind, StoreResult,
};
use crate::domain::{EntityKey, SecurityEvent, WorkflowInstance};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS workflow_instances (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    definition TEXT NOT NULL,
    current_state TEXT NOT NULL,
    approval_history TEXT NOT NULL,
    version INTEGER NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    state_entered_at TEXT NOT NULL,
    delegations TEXT NOT NULL,
    escalations TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);

CREATE TABLE IF NOT EXISTS security_events (
    id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    step INTEGER,
    from_state TEXT NOT NULL,
    to_state TEXT NOT NULL,
    detail TEXT NOT NULL,
    at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_security_events_entity
ON security_events(entity_type, entity_id);
";

const SELECT_INSTANCE: &str = "SELECT entity_type, entity_id, id, owner_id, definition, \
     current_state, approval_history, version, started_at, completed_at, state_entered_at, \
     delegations, escalations FROM workflow_instances WHERE entity_type = ?1 AND entity_id = ?2";

/// Map a rusqlite failure to a store error kind.
fn classify(operation: &'static str, err: &rusqlite::Error) -> StoreError {
    let kind = match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::DatabaseBusy => StoreErrorKind::Busy,
            ErrorCode::DatabaseLocked => StoreErrorKind::Deadlock,
            ErrorCode::ConstraintViolation => StoreErrorKind::AlreadyExists,
            ErrorCode::CannotOpen | ErrorCode::NotADatabase => StoreErrorKind::Disconnected,
            ErrorCode::DatabaseCorrupt => StoreErrorKind::Corrupt,
            _ => StoreErrorKind::Other,
        },
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            StoreErrorKind::Corrupt
        }
        _ => StoreErrorKind::Other,
    };
    StoreError::new(kind, operation, err.to_string())
}

fn corrupt(operation: &'static str, what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::new(StoreErrorKind::Corrupt, operation, format!("{what}: {err}"))
}

fn parse_time(operation: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(operation, "timestamp", e))
}

fn to_json<T: serde::Serialize>(operation: &'static str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|e| StoreError::new(StoreErrorKind::Other, operation, e.to_string()))
}

fn version_param(operation: &'static str, version: u64) -> StoreResult<i64> {
    i64::try_from(version).map_err(|_| {
        StoreError::new(
            StoreErrorKind::Other,
            operation,
            format!("version {version} out of range"),
        )
    })
}

/// Raw row before JSON and timestamp decoding.
struct RawInstance {
    entity_type: String,
    entity_id: String,
    id: String,
    owner_id: String,
    definition: String,
    current_state: String,
    approval_history: String,
    version: i64,
    started_at: String,
    completed_at: Option<String>,
    state_entered_at: String,
    delegations: String,
    escalations: String,
}

impl RawInstance {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            id: row.get(2)?,
            owner_id: row.get(3)?,
            definition: row.get(4)?,
            current_state: row.get(5)?,
            approval_history: row.get(6)?,
            version: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            state_entered_at: row.get(10)?,
            delegations: row.get(11)?,
            escalations: row.get(12)?,
        })
    }

    fn decode(self, operation: &'static str) -> StoreResult<WorkflowInstance> {
        Ok(WorkflowInstance {
            id: Uuid::parse_str(&self.id).map_err(|e| corrupt(operation, "id", e))?,
            key: EntityKey::new(self.entity_type, self.entity_id),
            owner_id: self.owner_id,
            definition: self.definition,
            current_state: self.current_state,
            approval_history: serde_json::from_str(&self.approval_history)
                .map_err(|e| corrupt(operation, "approval_history", e))?,
            version: u64::try_from(self.version).map_err(|e| corrupt(operation, "version", e))?,
            started_at: parse_time(operation, &self.started_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(|raw| parse_time(operation, raw))
                .transpose()?,
            state_entered_at: parse_time(operation, &self.state_entered_at)?,
            delegations: serde_json::from_str(&self.delegations)
                .map_err(|e| corrupt(operation, "delegations", e))?,
            escalations: serde_json::from_str(&self.escalations)
                .map_err(|e| corrupt(operation, "escalations", e))?,
        })
    }
}

fn select_instance(
    conn: &Connection,
    operation: &'static str,
    key: &EntityKey,
) -> StoreResult<Option<WorkflowInstance>> {
    let raw = conn
        .query_row(
            SELECT_INSTANCE,
            params![key.entity_type, key.entity_id],
            RawInstance::from_row,
        )
        .optional()
        .map_err(|e| classify(operation, &e))?;
    raw.map(|r| r.decode(operation)).transpose()
}

fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

/// Connection factory for a `SQLite` database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and migrate it.
    pub async fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> StoreResult<Self> {
        let store = Self {
            db_path: path.into(),
            busy_timeout,
        };
        store.migrate().await?;
        tracing::info!(path = %store.db_path.display(), "SQLite store ready");
        Ok(store)
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn migrate(&self) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;

        task::spawn_blocking(move || -> StoreResult<()> {
            let conn = Connection::open(&db_path).map_err(|e| classify("migrate", &e))?;
            configure(&conn, busy_timeout).map_err(|e| classify("migrate", &e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| classify("migrate", &e))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::new(StoreErrorKind::Other, "migrate", e.to_string()))?
    }

    /// Number of audit rows recorded for `key`.
    pub async fn audit_count(&self, key: &EntityKey) -> StoreResult<u64> {
        let conn = self.connect().await?;
        let key = key.clone();
        conn.blocking("audit_count", move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM security_events WHERE entity_type = ?1 AND entity_id = ?2",
                    params![key.entity_type, key.entity_id],
                    |row| row.get(0),
                )
                .map_err(|e| classify("audit_count", &e))?;
            u64::try_from(count).map_err(|e| corrupt("audit_count", "count", e))
        })
        .await
    }
}

#[async_trait]
impl ConnectionFactory for SqliteStore {
    type Connection = SqliteConnection;

    async fn connect(&self) -> StoreResult<SqliteConnection> {
        let db_path = self.db_path.clone();
        let busy_timeout = self.busy_timeout;

        let conn = task::spawn_blocking(move || -> StoreResult<Connection> {
            let conn = Connection::open(&db_path).map_err(|e| classify("connect", &e))?;
            configure(&conn, busy_timeout).map_err(|e| classify("connect", &e))?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::new(StoreErrorKind::Disconnected, "connect", e.to_string()))??;

        Ok(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
            in_tx: false,
        })
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.db_path.display())
    }
}

/// One `SQLite` connection.
#[derive(Debug)]
pub struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    in_tx: bool,
}

impl SqliteConnection {
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| {
            StoreError::new(
                StoreErrorKind::Disconnected,
                operation,
                format!("blocking task failed: {e}"),
            )
        })?
    }

    fn require_tx(&self, operation: &'static str) -> StoreResult<()> {
        if self.in_tx {
            Ok(())
        } else {
            Err(StoreError::no_transaction(operation))
        }
    }
}

#[async_trait]
impl StoreConnection for SqliteConnection {
    async fn ping(&mut self) -> StoreResult<()> {
        self.blocking("ping", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| classify("ping", &e))
        })
        .await
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> StoreResult<()> {
        // SQLite transactions are serializable; IMMEDIATE takes the write lock
        // up front instead of upgrading later.
        let statement = match isolation {
            IsolationLevel::ReadCommitted | IsolationLevel::RepeatableRead => "BEGIN DEFERRED",
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
        };
        // Marked before the await: if this future is dropped mid-flight the
        // blocking BEGIN still runs, and rollback must know to undo it.
        self.in_tx = true;
        let result = self
            .blocking("begin", move |conn| {
                if !conn.is_autocommit() {
                    tracing::warn!("Rolling back a transaction left open on a pooled connection");
                    conn.execute_batch("ROLLBACK")
                        .map_err(|e| classify("begin", &e))?;
                }
                conn.execute_batch(statement)
                    .map_err(|e| classify("begin", &e))
            })
            .await;
        if result.is_err() {
            self.in_tx = false;
        }
        result
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.require_tx("commit")?;
        let result = self
            .blocking("commit", |conn| {
                conn.execute_batch("COMMIT")
                    .map_err(|e| classify("commit", &e))
            })
            .await;
        if result.is_ok() {
            self.in_tx = false;
        }
        result
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_tx {
            return Ok(());
        }
        self.in_tx = false;
        self.blocking("rollback", |conn| {
            if conn.is_autocommit() {
                return Ok(());
            }
            conn.execute_batch("ROLLBACK")
                .map_err(|e| classify("rollback", &e))
        })
        .await
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    async fn lock_row(&mut self, key: &EntityKey) -> StoreResult<WorkflowInstance> {
        self.require_tx("lock_row")?;
        let key = key.clone();
        self.blocking("lock_row", move |conn| {
            let touched = conn
                .execute(
                    "UPDATE workflow_instances SET version = version \
                     WHERE entity_type = ?1 AND entity_id = ?2",
                    params![key.entity_type, key.entity_id],
                )
                .map_err(|e| classify("lock_row", &e))?;
            if touched == 0 {
                return Err(StoreError::not_found("lock_row", &key));
            }
            select_instance(conn, "lock_row", &key)?
                .ok_or_else(|| StoreError::not_found("lock_row", &key))
        })
        .await
    }

    async fn read(&mut self, key: &EntityKey) -> StoreResult<Option<WorkflowInstance>> {
        let key = key.clone();
        self.blocking("read", move |conn| select_instance(conn, "read", &key))
            .await
    }

    async fn insert(&mut self, instance: &WorkflowInstance) -> StoreResult<()> {
        self.require_tx("insert")?;
        let row = instance.clone();
        self.blocking("insert", move |conn| {
            let history = to_json("insert", &row.approval_history)?;
            let delegations = to_json("insert", &row.delegations)?;
            let escalations = to_json("insert", &row.escalations)?;
            let version = version_param("insert", row.version)?;
            conn.execute(
                "INSERT INTO workflow_instances (entity_type, entity_id, id, owner_id, \
                 definition, current_state, approval_history, version, started_at, \
                 completed_at, state_entered_at, delegations, escalations) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.key.entity_type,
                    row.key.entity_id,
                    row.id.to_string(),
                    row.owner_id,
                    row.definition,
                    row.current_state,
                    history,
                    version,
                    row.started_at.to_rfc3339(),
                    row.completed_at.map(|t| t.to_rfc3339()),
                    row.state_entered_at.to_rfc3339(),
                    delegations,
                    escalations,
                ],
            )
            .map_err(|e| classify("insert", &e))?;
            Ok(())
        })
        .await
    }

    async fn write(&mut self, instance: &WorkflowInstance) -> StoreResult<()> {
        self.require_tx("write")?;
        let row = instance.clone();
        self.blocking("write", move |conn| {
            let history = to_json("write", &row.approval_history)?;
            let delegations = to_json("write", &row.delegations)?;
            let escalations = to_json("write", &row.escalations)?;
            let version = version_param("write", row.version)?;
            let expected = version_param("write", row.version.saturating_sub(1))?;

            let updated = conn
                .execute(
                    "UPDATE workflow_instances SET current_state = ?3, approval_history = ?4, \
                     version = ?5, completed_at = ?6, state_entered_at = ?7, delegations = ?8, \
                     escalations = ?9 \
                     WHERE entity_type = ?1 AND entity_id = ?2 AND version = ?10",
                    params![
                        row.key.entity_type,
                        row.key.entity_id,
                        row.current_state,
                        history,
                        version,
                        row.completed_at.map(|t| t.to_rfc3339()),
                        row.state_entered_at.to_rfc3339(),
                        delegations,
                        escalations,
                        expected,
                    ],
                )
                .map_err(|e| classify("write", &e))?;
            if updated == 1 {
                return Ok(());
            }

            let stored: Option<i64> = conn
                .query_row(
                    "SELECT version FROM workflow_instances \
                     WHERE entity_type = ?1 AND entity_id = ?2",
                    params![row.key.entity_type, row.key.entity_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| classify("write", &e))?;
            match stored {
                Some(stored) => Err(StoreError::new(
                    StoreErrorKind::VersionConflict,
                    "write",
                    format!(
                        "{} expected stored version {expected}, found {stored}",
                        row.key
                    ),
                )),
                None => Err(StoreError::not_found("write", &row.key)),
            }
        })
        .await
    }

    async fn append_audit(&mut self, event: &SecurityEvent) -> StoreResult<()> {
        self.require_tx("append_audit")?;
        let event = event.clone();
        self.blocking("append_audit", move |conn| {
            let step = event
                .step
                .map(|s| i64::try_from(s).unwrap_or(i64::MAX));
            conn.execute(
                "INSERT INTO security_events (id, entity_type, entity_id, action, actor_id, \
                 step, from_state, to_state, detail, at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id.to_string(),
                    event.entity.entity_type,
                    event.entity.entity_id,
                    event.action.as_str(),
                    event.actor_id,
                    step,
                    event.from_state,
                    event.to_state,
                    event.detail,
                    event.at.to_rfc3339(),
                ],
            )
            .map_err(|e| classify("append_audit", &e))?;
            Ok(())
        })
        .await
    }
}
