//! Atomic units of work with classified retries.
//!
//! [`TransactionCoordinator::run`] checks out one pooled connection, then for
//! each attempt opens a transaction, runs the unit of work under a wall-clock
//! deadline and commits. Any failure rolls back first. Deadlock-like storage
//! failures and store version conflicts are retried with backoff inside their
//! own budgets; every other storage failure is wrapped as
//! [`EngineError::Transaction`], and engine errors raised by the unit of work
//! itself pass through unchanged. Raw [`EngineError::Storage`] values never
//! leave this module.
//!
//! ```rust,ignore
//! let options = TxOptions::new("approve").with_entity(key.to_string());
//! let outcome = coordinator
//!     .run(&options, move |conn| {
//!         let key = key.clone();
//!         Box::pin(async move {
//!             let instance = conn.lock_row(&key).await?;
//!             Ok::<_, EngineError>(instance.version)
//!         })
//!     })
//!     .await?;
//! ```

mod retry;

pub use retry::{BackoffStrategy, FailureClass, RetryPolicy};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::TransactionConfig;
use crate::domain::{EntityKey, SecurityEvent, WorkflowInstance};
use crate::error::{EngineError, EngineResult};
use crate::logging::OpTimer;
use crate::pool::ConnectionPoolManager;
use crate::store::{ConnectionFactory, IsolationLevel, StoreConnection};

/// A stored unit of work, runnable any number of times.
pub type TxOp<C, T> =
    Arc<dyn for<'c> Fn(&'c mut C) -> BoxFuture<'c, EngineResult<T>> + Send + Sync>;

/// Box a closure as a [`TxOp`].
pub fn tx_op<C, T, Op>(op: Op) -> TxOp<C, T>
where
    Op: for<'c> Fn(&'c mut C) -> BoxFuture<'c, EngineResult<T>> + Send + Sync + 'static,
{
    Arc::new(op)
}

/// Value produced by an optimistic update plus the audit event to append in
/// the same transaction.
pub type Audited<T> = (T, Option<SecurityEvent>);

/// Per-call overrides.
#[derive(Debug, Clone)]
pub struct TxOptions {
    /// Name used in logs and errors.
    pub operation: String,
    /// Entity the work concerns, for logs and errors.
    pub entity: Option<String>,
    /// Isolation override.
    pub isolation: Option<IsolationLevel>,
    /// Wall-clock ceiling override.
    pub timeout: Option<Duration>,
}

impl TxOptions {
    /// Options with coordinator defaults.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            entity: None,
            isolation: None,
            timeout: None,
        }
    }

    /// Tag with an entity.
    #[must_use]
    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    /// Override isolation.
    #[must_use]
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    /// Override the wall-clock ceiling.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Default)]
struct TransactionStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    deadlocks: AtomicU64,
    optimistic_conflicts: AtomicU64,
    timeouts: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatsSnapshot {
    /// Attempts started.
    pub attempts: u64,
    /// Retries scheduled.
    pub retries: u64,
    /// Deadlock-like failures seen.
    pub deadlocks: u64,
    /// Optimistic conflicts seen.
    pub optimistic_conflicts: u64,
    /// Units of work that hit their deadline.
    pub timeouts: u64,
    /// Successful commits.
    pub commits: u64,
    /// Rollbacks issued.
    pub rollbacks: u64,
}

struct RetryState {
    attempts: u32,
    deadlock_retries: u32,
    conflict_retries: u32,
}

/// Runs units of work atomically over a connection pool.
pub struct TransactionCoordinator<F: ConnectionFactory> {
    pool: ConnectionPoolManager<F>,
    policy: RetryPolicy,
    isolation: IsolationLevel,
    timeout: Duration,
    stats: TransactionStats,
}

impl<F: ConnectionFactory> std::fmt::Debug for TransactionCoordinator<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("policy", &self.policy)
            .field("isolation", &self.isolation)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> TransactionCoordinator<F> {
    /// Create a coordinator from configuration.
    pub fn new(pool: ConnectionPoolManager<F>, config: &TransactionConfig) -> Self {
        Self {
            pool,
            policy: RetryPolicy::from_config(config),
            isolation: config.isolation_level,
            timeout: config.timeout(),
            stats: TransactionStats::default(),
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The pool connections come from.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPoolManager<F> {
        &self.pool
    }

    /// Retry policy in force.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> TransactionStatsSnapshot {
        let s = &self.stats;
        TransactionStatsSnapshot {
            attempts: s.attempts.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            deadlocks: s.deadlocks.load(Ordering::Relaxed),
            optimistic_conflicts: s.optimistic_conflicts.load(Ordering::Relaxed),
            timeouts: s.timeouts.load(Ordering::Relaxed),
            commits: s.commits.load(Ordering::Relaxed),
            rollbacks: s.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Run `op` atomically, retrying transient failures.
    ///
    /// `op` may run several times and must not keep side effects outside the
    /// connection. Pool errors surface immediately without retry.
    pub async fn run<T, Op>(&self, options: &TxOptions, op: Op) -> EngineResult<T>
    where
        T: Send,
        Op: for<'c> Fn(&'c mut F::Connection) -> BoxFuture<'c, EngineResult<T>> + Send + Sync,
    {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let isolation = options.isolation.unwrap_or(self.isolation);
        let deadline = Instant::now() + timeout;
        let timer = OpTimer::new("transaction", options.operation.clone());

        let mut conn = self.pool.acquire().await?;
        let mut state = RetryState {
            attempts: 0,
            deadlock_retries: 0,
            conflict_retries: 0,
        };

        let result = loop {
            state.attempts += 1;
            self.stats.attempts.fetch_add(1, Ordering::Relaxed);

            let attempt = tokio::time::timeout_at(deadline, async {
                conn.begin(isolation).await?;
                op(&mut *conn).await
            })
            .await;

            let error = match attempt {
                Err(_) => {
                    self.rollback(&mut *conn, options).await;
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    break Err(self.timeout_error(options, timeout, state.attempts));
                }
                Ok(Ok(value)) => match conn.commit().await {
                    Ok(()) => {
                        self.stats.commits.fetch_add(1, Ordering::Relaxed);
                        break Ok(value);
                    }
                    Err(e) => EngineError::Storage(e),
                },
                Ok(Err(e)) => e,
            };

            self.rollback(&mut *conn, options).await;

            let delay = match self.next_delay(error, options, &mut state) {
                Ok(delay) => delay,
                Err(terminal) => break Err(terminal),
            };

            if Instant::now() + delay >= deadline {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                break Err(self.timeout_error(options, timeout, state.attempts));
            }

            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
        };

        timer.finish_with_result(result.as_ref());
        result
    }

    /// Decide whether to retry `error`; `Ok` carries the backoff delay.
    fn next_delay(
        &self,
        error: EngineError,
        options: &TxOptions,
        state: &mut RetryState,
    ) -> Result<Duration, EngineError> {
        let class = FailureClass::classify(&error);
        let entity = options.entity.clone();

        let source = match (class, error) {
            (FailureClass::Domain, error) => return Err(error),
            (_, EngineError::Storage(source)) => source,
            (_, other) => return Err(other),
        };

        let retry = match class {
            FailureClass::DeadlockLike => {
                self.stats.deadlocks.fetch_add(1, Ordering::Relaxed);
                if state.deadlock_retries >= self.policy.deadlock_retry_attempts {
                    tracing::error!(
                        operation = %options.operation,
                        entity = ?entity,
                        attempts = state.attempts,
                        error = %source,
                        "Deadlock-like failure persisted through all retries"
                    );
                    return Err(EngineError::Deadlock {
                        operation: options.operation.clone(),
                        entity,
                        attempts: state.attempts,
                        source,
                    });
                }
                state.deadlock_retries += 1;
                state.deadlock_retries
            }
            FailureClass::OptimisticConflict => {
                self.stats.optimistic_conflicts.fetch_add(1, Ordering::Relaxed);
                if state.conflict_retries >= self.policy.max_retries {
                    return Err(EngineError::OptimisticLock {
                        entity: entity.unwrap_or_else(|| options.operation.clone()),
                        attempts: state.attempts,
                        detail: source.message,
                    });
                }
                state.conflict_retries += 1;
                state.conflict_retries
            }
            FailureClass::Terminal | FailureClass::Domain => {
                tracing::error!(
                    operation = %options.operation,
                    entity = ?entity,
                    attempts = state.attempts,
                    error = %source,
                    "Transaction failed"
                );
                return Err(EngineError::Transaction {
                    operation: options.operation.clone(),
                    entity,
                    attempts: state.attempts,
                    source,
                });
            }
        };

        let delay = self.policy.delay(retry);
        tracing::warn!(
            operation = %options.operation,
            entity = ?options.entity,
            attempt = state.attempts,
            retry,
            class = ?class,
            delay_ms = delay.as_millis(),
            error = %source,
            "Retrying transaction"
        );
        Ok(delay)
    }

    async fn rollback(&self, conn: &mut F::Connection, options: &TxOptions) {
        if !conn.in_transaction() {
            return;
        }
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = conn.rollback().await {
            tracing::warn!(operation = %options.operation, error = %e, "Rollback failed");
        }
    }

    fn timeout_error(&self, options: &TxOptions, timeout: Duration, attempts: u32) -> EngineError {
        tracing::warn!(
            operation = %options.operation,
            entity = ?options.entity,
            timeout_ms = timeout.as_millis(),
            attempts,
            "Transaction exceeded its deadline"
        );
        EngineError::TransactionTimeout {
            operation: options.operation.clone(),
            timeout,
            attempts,
        }
    }

    /// Apply `update_fn` to the instance if its stored version still matches
    /// `snapshot.version`, then bump the version and write it back.
    ///
    /// A version that moved since the snapshot was taken fails immediately
    /// with [`EngineError::OptimisticLock`]; a race lost at write time is
    /// retried, and the retry then observes the moved version.
    pub async fn execute_with_optimistic_locking<T, U>(
        &self,
        operation: &str,
        snapshot: &WorkflowInstance,
        update_fn: U,
    ) -> EngineResult<(WorkflowInstance, T)>
    where
        T: Send + 'static,
        U: Fn(&mut WorkflowInstance) -> EngineResult<Audited<T>> + Send + Sync + 'static,
    {
        let key = snapshot.key.clone();
        let expected = snapshot.version;
        let update = Arc::new(update_fn);
        let options = TxOptions::new(operation).with_entity(key.to_string());

        self.run(&options, move |conn| {
            Box::pin(optimistic_update(
                conn,
                key.clone(),
                expected,
                Arc::clone(&update),
            ))
        })
        .await
    }

    /// Run `operations` in chunks of `chunk_size`, one transaction per chunk.
    ///
    /// Chunks commit independently; on failure the error is returned and
    /// earlier chunks stay committed.
    pub async fn batch_operation<T>(
        &self,
        operation: &str,
        operations: Vec<TxOp<F::Connection, T>>,
        chunk_size: usize,
    ) -> EngineResult<Vec<T>>
    where
        T: Send + 'static,
    {
        let chunk_size = chunk_size.max(1);
        let total = operations.len();
        let mut results = Vec::with_capacity(total);

        for (index, chunk) in operations.chunks(chunk_size).enumerate() {
            let chunk: Arc<[TxOp<F::Connection, T>]> = chunk.to_vec().into();
            let options = TxOptions::new(format!("{operation}[chunk {index}]"));

            let values = self
                .run(&options, move |conn| Box::pin(run_chunk(conn, Arc::clone(&chunk))))
                .await?;

            tracing::debug!(
                operation,
                chunk = index,
                committed = values.len(),
                "Batch chunk committed"
            );
            results.extend(values);
        }

        tracing::info!(operation, total, chunk_size, "Batch operation complete");
        Ok(results)
    }
}

async fn optimistic_update<C, T, U>(
    conn: &mut C,
    key: EntityKey,
    expected: u64,
    update: Arc<U>,
) -> EngineResult<(WorkflowInstance, T)>
where
    C: StoreConnection,
    U: Fn(&mut WorkflowInstance) -> EngineResult<Audited<T>>,
{
    let mut current = conn
        .read(&key)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("workflow for {key}")))?;

    if current.version != expected {
        return Err(EngineError::OptimisticLock {
            entity: key.to_string(),
            attempts: 1,
            detail: format!("expected version {expected}, found {}", current.version),
        });
    }

    let (value, event) = update(&mut current)?;
    current.version = expected + 1;
    conn.write(&current).await?;
    if let Some(event) = event {
        conn.append_audit(&event).await?;
    }
    Ok((current, value))
}

async fn run_chunk<C, T>(conn: &mut C, chunk: Arc<[TxOp<C, T>]>) -> EngineResult<Vec<T>> {
    let mut values = Vec::with_capacity(chunk.len());
    for op in chunk.iter() {
        values.push(op(&mut *conn).await?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::config::{PoolConfig, ScalingConfig};
    use crate::domain::{StepConfig, WorkflowDefinition};
    use crate::store::{MemoryStore, StoreErrorKind};

    fn coordinator(store: &MemoryStore) -> TransactionCoordinator<MemoryStore> {
        let pool =
            ConnectionPoolManager::new(store.clone(), PoolConfig::default(), ScalingConfig::default());
        let config = TransactionConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..TransactionConfig::default()
        };
        TransactionCoordinator::new(pool, &config)
    }

    fn seeded(store: &MemoryStore) -> WorkflowInstance {
        let def = WorkflowDefinition::new("w", vec![StepConfig::new("s", "r")]);
        let instance = WorkflowInstance::new(EntityKey::new("doc", "1"), "owner", &def);
        store.put(instance.clone());
        instance
    }

    fn bump(key: EntityKey) -> TxOp<crate::store::MemoryConnection, u64> {
        tx_op(move |conn| Box::pin(bump_row(conn, key.clone())))
    }

    async fn bump_row(
        conn: &mut crate::store::MemoryConnection,
        key: EntityKey,
    ) -> EngineResult<u64> {
        let mut row = conn.lock_row(&key).await?;
        row.version += 1;
        conn.write(&row).await?;
        Ok(row.version)
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        let op = bump(instance.key.clone());

        let version = coordinator
            .run(&TxOptions::new("bump"), move |conn| op(conn))
            .await
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(store.snapshot(&instance.key).unwrap().version, 2);
        assert_eq!(coordinator.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_domain_error_rolls_back_without_retry() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        let key = instance.key.clone();

        let err = coordinator
            .run(&TxOptions::new("reject"), move |conn| {
                let key = key.clone();
                Box::pin(async move {
                    let mut row = conn.lock_row(&key).await?;
                    row.version += 1;
                    conn.write(&row).await?;
                    Err::<(), _>(EngineError::validation("nope"))
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(store.snapshot(&instance.key).unwrap().version, 1);
        let stats = coordinator.stats();
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.rollbacks, 1);
    }

    #[tokio::test]
    async fn test_deadlock_retried_until_success() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        store.fail_next(3, StoreErrorKind::Deadlock);
        let op = bump(instance.key.clone());

        let version = coordinator
            .run(&TxOptions::new("bump"), move |conn| op(conn))
            .await
            .unwrap();

        assert_eq!(version, 2);
        let stats = coordinator.stats();
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.retries, 3);
        assert_eq!(stats.deadlocks, 3);
    }

    #[tokio::test]
    async fn test_deadlock_budget_exhausted() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        store.fail_next(100, StoreErrorKind::Busy);
        let op = bump(instance.key.clone());

        let err = coordinator
            .run(&TxOptions::new("bump"), move |conn| op(conn))
            .await
            .unwrap_err();

        match err {
            EngineError::Deadlock { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("expected deadlock, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_storage_error_wrapped() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        store.fail_next(1, StoreErrorKind::Corrupt);
        let op = bump(instance.key.clone());

        let err = coordinator
            .run(&TxOptions::new("bump"), move |conn| op(conn))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Transaction { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_version_conflicts_use_optimistic_budget() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        let attempts = Arc::new(AtomicU32::new(0));
        let key = instance.key.clone();
        let counter = Arc::clone(&attempts);

        let err = coordinator
            .run(&TxOptions::new("stale").with_entity(key.to_string()), move |conn| {
                let key = key.clone();
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let row = conn.lock_row(&key).await?;
                    conn.write(&row).await?;
                    Ok::<_, EngineError>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::OptimisticLock { attempts: 4, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rolls_back() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);
        let key = instance.key.clone();

        let err = coordinator
            .run(
                &TxOptions::new("slow").with_timeout(Duration::from_millis(100)),
                move |conn| {
                    let key = key.clone();
                    Box::pin(async move {
                        let mut row = conn.lock_row(&key).await?;
                        row.version += 1;
                        conn.write(&row).await?;
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, EngineError>(())
                    })
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::TransactionTimeout { .. }));
        assert_eq!(store.snapshot(&instance.key).unwrap().version, 1);
        assert_eq!(coordinator.pool().metrics().idle, 1);
    }

    #[tokio::test]
    async fn test_optimistic_locking_applies_update() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);

        let (updated, previous) = coordinator
            .execute_with_optimistic_locking("rename", &instance, |row| {
                let previous = std::mem::replace(&mut row.owner_id, "new-owner".to_string());
                Ok((previous, None))
            })
            .await
            .unwrap();

        assert_eq!(previous, "owner");
        assert_eq!(updated.version, 2);
        assert_eq!(store.snapshot(&instance.key).unwrap().owner_id, "new-owner");
    }

    #[tokio::test]
    async fn test_optimistic_locking_detects_stale_snapshot() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);

        let mut moved = instance.clone();
        moved.version = 2;
        store.put(moved);

        let err = coordinator
            .execute_with_optimistic_locking("rename", &instance, |_row| Ok(((), None)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::OptimisticLock { .. }));
        assert_eq!(coordinator.stats().attempts, 1);
    }

    #[tokio::test]
    async fn test_batch_operation_chunks() {
        let store = MemoryStore::default();
        let instance = seeded(&store);
        let coordinator = coordinator(&store);

        let ops: Vec<_> = (0..5).map(|_| bump(instance.key.clone())).collect();
        let versions = coordinator.batch_operation("bulk", ops, 2).await.unwrap();

        assert_eq!(versions, vec![2, 3, 4, 5, 6]);
        assert_eq!(coordinator.stats().commits, 3);
    }
}
