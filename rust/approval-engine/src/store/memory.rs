//! In-process store with row locks, staged writes and fault injection.
//!
//! Row locks are per-key async mutexes held until the owning transaction ends;
//! waiting longer than the lock-wait timeout fails with
//! [`StoreErrorKind::LockTimeout`], the in-memory analogue of a database
//! lock-wait timeout. Writes are staged per transaction and applied on commit
//! after re-checking every row version, so unlocked writers racing on the same
//! row are caught by the version check.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use super::{
    ConnectionFactory, IsolationLevel, StoreConnection, StoreError, StoreErrorKind, StoreResult,
};
use crate::domain::{EntityKey, SecurityEvent, WorkflowInstance};

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<EntityKey, WorkflowInstance>,
    audit: Vec<SecurityEvent>,
}

#[derive(Debug)]
struct Faults {
    data_remaining: u32,
    data_kind: StoreErrorKind,
    connect_remaining: u32,
    ping_remaining: u32,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            data_remaining: 0,
            data_kind: StoreErrorKind::Deadlock,
            connect_remaining: 0,
            ping_remaining: 0,
        }
    }
}

#[derive(Debug)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<EntityKey, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<Faults>,
    lock_wait: Duration,
    connections_opened: AtomicU64,
    commits: AtomicU64,
}

/// Shared in-memory store.
///
/// Cloning is cheap; clones see the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MemoryStore {
    /// Create an empty store with the given row lock-wait timeout.
    #[must_use]
    pub fn new(lock_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                lock_wait,
                connections_opened: AtomicU64::new(0),
                commits: AtomicU64::new(0),
            }),
        }
    }

    /// Fail the next `count` data operations with `kind`.
    pub fn fail_next(&self, count: u32, kind: StoreErrorKind) {
        let mut faults = self.shared.faults.lock();
        faults.data_remaining = count;
        faults.data_kind = kind;
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.shared.faults.lock().connect_remaining = count;
    }

    /// Fail the next `count` pings.
    pub fn fail_next_pings(&self, count: u32) {
        self.shared.faults.lock().ping_remaining = count;
    }

    /// Committed contents of a row.
    #[must_use]
    pub fn snapshot(&self, key: &EntityKey) -> Option<WorkflowInstance> {
        self.shared.tables.read().rows.get(key).cloned()
    }

    /// Overwrite a committed row directly, bypassing transactions.
    pub fn put(&self, instance: WorkflowInstance) {
        self.shared
            .tables
            .write()
            .rows
            .insert(instance.key.clone(), instance);
    }

    /// Committed audit rows, oldest first.
    #[must_use]
    pub fn audit_events(&self) -> Vec<SecurityEvent> {
        self.shared.tables.read().audit.clone()
    }

    /// Number of committed rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.shared.tables.read().rows.len()
    }

    /// Connections opened so far.
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::Relaxed)
    }

    /// Transactions committed so far.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    /// Open a connection without going through the factory trait.
    #[must_use]
    pub fn connection(&self) -> MemoryConnection {
        let id = self.shared.connections_opened.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
            tx: None,
        }
    }
}

#[async_trait]
impl ConnectionFactory for MemoryStore {
    type Connection = MemoryConnection;

    async fn connect(&self) -> StoreResult<MemoryConnection> {
        {
            let mut faults = self.shared.faults.lock();
            if faults.connect_remaining > 0 {
                faults.connect_remaining -= 1;
                return Err(StoreError::new(
                    StoreErrorKind::Disconnected,
                    "connect",
                    "injected connection failure",
                ));
            }
        }
        Ok(self.connection())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug, Default)]
struct PendingTx {
    held: HashMap<EntityKey, OwnedMutexGuard<()>>,
    inserts: HashMap<EntityKey, WorkflowInstance>,
    writes: HashMap<EntityKey, WorkflowInstance>,
    base_versions: HashMap<EntityKey, u64>,
    audit: Vec<SecurityEvent>,
}

/// Connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
    tx: Option<PendingTx>,
}

impl MemoryConnection {
    /// Connection number, unique per store.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    fn inject(&self, operation: &'static str) -> StoreResult<()> {
        let mut faults = self.shared.faults.lock();
        if faults.data_remaining > 0 {
            faults.data_remaining -= 1;
            return Err(StoreError::new(
                faults.data_kind,
                operation,
                "injected failure",
            ));
        }
        Ok(())
    }

    fn tx_mut(&mut self, operation: &'static str) -> StoreResult<&mut PendingTx> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::no_transaction(operation))
    }

    /// Row as seen by this connection: staged changes first, then committed.
    fn visible(&self, key: &EntityKey) -> Option<WorkflowInstance> {
        if let Some(tx) = &self.tx {
            if let Some(row) = tx.writes.get(key).or_else(|| tx.inserts.get(key)) {
                return Some(row.clone());
            }
        }
        self.shared.tables.read().rows.get(key).cloned()
    }

    fn row_lock(&self, key: &EntityKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.shared.row_locks.lock();
        Arc::clone(locks.entry(key.clone()).or_default())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&mut self) -> StoreResult<()> {
        let mut faults = self.shared.faults.lock();
        if faults.ping_remaining > 0 {
            faults.ping_remaining -= 1;
            return Err(StoreError::new(
                StoreErrorKind::Disconnected,
                "ping",
                "injected ping failure",
            ));
        }
        Ok(())
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> StoreResult<()> {
        if self.tx.is_some() {
            return Err(StoreError::new(
                StoreErrorKind::Other,
                "begin",
                "transaction already open",
            ));
        }
        tracing::trace!(connection = self.id, %isolation, "Memory transaction started");
        self.tx = Some(PendingTx::default());
        Ok(())
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::no_transaction("commit"))?;

        {
            let mut tables = self.shared.tables.write();

            for key in tx.inserts.keys() {
                if tables.rows.contains_key(key) {
                    return Err(StoreError::new(
                        StoreErrorKind::AlreadyExists,
                        "commit",
                        format!("{key} was inserted concurrently"),
                    ));
                }
            }
            for (key, base) in &tx.base_versions {
                let current = tables.rows.get(key).map(|row| row.version);
                if current != Some(*base) {
                    return Err(StoreError::new(
                        StoreErrorKind::VersionConflict,
                        "commit",
                        format!("{key} expected version {base}, found {current:?}"),
                    ));
                }
            }

            for (key, row) in tx.inserts {
                tables.rows.insert(key, row);
            }
            for (key, row) in tx.writes {
                tables.rows.insert(key, row);
            }
            tables.audit.extend(tx.audit);
        }
        self.shared.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        if self.tx.take().is_some() {
            tracing::trace!(connection = self.id, "Memory transaction rolled back");
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    async fn lock_row(&mut self, key: &EntityKey) -> StoreResult<WorkflowInstance> {
        self.inject("lock_row")?;
        let already_held = self.tx_mut("lock_row")?.held.contains_key(key);

        if !already_held {
            let lock = self.row_lock(key);
            let guard = tokio::time::timeout(self.shared.lock_wait, lock.lock_owned())
                .await
                .map_err(|_| {
                    StoreError::new(
                        StoreErrorKind::LockTimeout,
                        "lock_row",
                        format!("lock wait on {key} exceeded {:?}", self.shared.lock_wait),
                    )
                })?;
            self.tx_mut("lock_row")?.held.insert(key.clone(), guard);
        }

        self.visible(key)
            .ok_or_else(|| StoreError::not_found("lock_row", key))
    }

    async fn read(&mut self, key: &EntityKey) -> StoreResult<Option<WorkflowInstance>> {
        self.inject("read")?;
        Ok(self.visible(key))
    }

    async fn insert(&mut self, instance: &WorkflowInstance) -> StoreResult<()> {
        self.inject("insert")?;
        if self.visible(&instance.key).is_some() {
            return Err(StoreError::new(
                StoreErrorKind::AlreadyExists,
                "insert",
                format!("{} already has a workflow", instance.key),
            ));
        }
        self.tx_mut("insert")?
            .inserts
            .insert(instance.key.clone(), instance.clone());
        Ok(())
    }

    async fn write(&mut self, instance: &WorkflowInstance) -> StoreResult<()> {
        self.inject("write")?;
        let stored = self
            .visible(&instance.key)
            .ok_or_else(|| StoreError::not_found("write", &instance.key))?;

        let expected = instance.version.saturating_sub(1);
        if stored.version != expected {
            return Err(StoreError::new(
                StoreErrorKind::VersionConflict,
                "write",
                format!(
                    "{} expected stored version {expected}, found {}",
                    instance.key, stored.version
                ),
            ));
        }

        let tx = self.tx_mut("write")?;
        if let Some(pending) = tx.inserts.get_mut(&instance.key) {
            *pending = instance.clone();
        } else {
            tx.base_versions
                .entry(instance.key.clone())
                .or_insert(expected);
            tx.writes.insert(instance.key.clone(), instance.clone());
        }
        Ok(())
    }

    async fn append_audit(&mut self, event: &SecurityEvent) -> StoreResult<()> {
        self.inject("append_audit")?;
        self.tx_mut("append_audit")?.audit.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StepConfig, WorkflowDefinition};

    fn instance(id: &str) -> WorkflowInstance {
        let def = WorkflowDefinition::new("w", vec![StepConfig::new("s", "r")]);
        WorkflowInstance::new(EntityKey::new("doc", id), "owner", &def)
    }

    #[tokio::test]
    async fn test_insert_visible_after_commit() {
        let store = MemoryStore::default();
        let mut conn = store.connection();
        let row = instance("1");

        conn.begin(IsolationLevel::default()).await.unwrap();
        conn.insert(&row).await.unwrap();
        assert!(store.snapshot(&row.key).is_none());
        conn.commit().await.unwrap();

        assert_eq!(store.snapshot(&row.key), Some(row));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::default();
        let row = instance("1");
        store.put(row.clone());

        let mut conn = store.connection();
        conn.begin(IsolationLevel::default()).await.unwrap();
        let mut locked = conn.lock_row(&row.key).await.unwrap();
        locked.version += 1;
        locked.current_state = "approved".to_string();
        conn.write(&locked).await.unwrap();
        conn.rollback().await.unwrap();

        assert_eq!(store.snapshot(&row.key).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let store = MemoryStore::default();
        let row = instance("1");
        store.put(row.clone());

        let mut conn = store.connection();
        conn.begin(IsolationLevel::default()).await.unwrap();
        let err = conn.write(&row).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::VersionConflict);
    }

    #[tokio::test]
    async fn test_unlocked_writers_conflict_at_commit() {
        let store = MemoryStore::default();
        let row = instance("1");
        store.put(row.clone());

        let mut first = store.connection();
        let mut second = store.connection();
        first.begin(IsolationLevel::default()).await.unwrap();
        second.begin(IsolationLevel::default()).await.unwrap();

        let mut next = row.clone();
        next.version = 2;
        first.write(&next).await.unwrap();
        second.write(&next).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::VersionConflict);
    }

    #[tokio::test]
    async fn test_lock_wait_timeout() {
        let store = MemoryStore::new(Duration::from_millis(20));
        let row = instance("1");
        store.put(row.clone());

        let mut holder = store.connection();
        holder.begin(IsolationLevel::default()).await.unwrap();
        holder.lock_row(&row.key).await.unwrap();

        let mut waiter = store.connection();
        waiter.begin(IsolationLevel::default()).await.unwrap();
        let err = waiter.lock_row(&row.key).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::LockTimeout);

        holder.rollback().await.unwrap();
        waiter.rollback().await.unwrap();
        waiter.begin(IsolationLevel::default()).await.unwrap();
        assert!(waiter.lock_row(&row.key).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_missing_row_is_not_found() {
        let store = MemoryStore::default();
        let mut conn = store.connection();
        conn.begin(IsolationLevel::default()).await.unwrap();
        let err = conn
            .lock_row(&EntityKey::new("doc", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_mutation_requires_transaction() {
        let store = MemoryStore::default();
        let mut conn = store.connection();
        assert!(conn.insert(&instance("1")).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::default();
        store.fail_next(2, StoreErrorKind::Deadlock);
        let mut conn = store.connection();
        let key = EntityKey::new("doc", "1");

        assert_eq!(
            conn.read(&key).await.unwrap_err().kind,
            StoreErrorKind::Deadlock
        );
        assert!(conn.read(&key).await.is_err());
        assert!(conn.read(&key).await.unwrap().is_none());

        store.fail_next_connects(1);
        assert!(store.connect().await.is_err());
        assert!(store.connect().await.is_ok());
    }
}
