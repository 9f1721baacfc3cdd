//! Bounded connection pool with scoped checkout, health telemetry and a
//! scaling advisory.
//!
//! Capacity is `pool_size + max_overflow` permits on a semaphore. A checkout
//! holds one permit for its whole life; the [`ScopedConnection`] guard hands
//! the connection back (or discards it) on every exit path, including panics
//! and cancelled futures. Up to `pool_size` connections are kept idle;
//! overflow connections are closed on return.

mod metrics;

pub use metrics::{
    FAILURE_RATE_CRITICAL, HealthReport, HealthStatus, PoolMetrics, ScalingAction,
    ScalingRecommendation, UTILIZATION_WARNING_PERCENT, assess, recommend,
};

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{PoolConfig, ScalingConfig};
use crate::error::{EngineError, EngineResult};
use crate::store::{ConnectionFactory, StoreConnection};
use metrics::PoolCounters;

struct IdleConnection<C> {
    conn: C,
    created_at: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    scaling: ScalingConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<F::Connection>>>,
    counters: PoolCounters,
    recent_timeouts: Mutex<VecDeque<Instant>>,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn record_timeout(&self) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        self.recent_timeouts.lock().push_back(Instant::now());
    }

    fn recent_timeout_count(&self) -> usize {
        let window = Duration::from_secs(self.scaling.recent_window_secs);
        let mut recent = self.recent_timeouts.lock();
        let now = Instant::now();
        while recent
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            recent.pop_front();
        }
        recent.len()
    }

    fn metrics(&self) -> PoolMetrics {
        let idle = self.idle.lock().len();
        self.counters
            .snapshot(self.config.pool_size, self.config.max_overflow, idle)
    }

    fn recommendation(&self) -> ScalingRecommendation {
        let metrics = self.metrics();
        recommend(
            &self.scaling,
            self.config.pool_size,
            metrics.utilization(),
            self.recent_timeout_count(),
        )
    }
}

/// Connection pool over a [`ConnectionFactory`].
///
/// Cloning shares the same pool.
pub struct ConnectionPoolManager<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPoolManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPoolManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("store", &self.inner.factory.describe())
            .field("pool_size", &self.inner.config.pool_size)
            .field("max_overflow", &self.inner.config.max_overflow)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    /// Create a pool. Connections are opened lazily.
    pub fn new(factory: F, config: PoolConfig, scaling: ScalingConfig) -> Self {
        let capacity = config.capacity();
        tracing::info!(
            store = %factory.describe(),
            pool_size = config.pool_size,
            max_overflow = config.max_overflow,
            "Connection pool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                scaling,
                semaphore: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(VecDeque::new()),
                counters: PoolCounters::default(),
                recent_timeouts: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Underlying connection factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Check out a connection, waiting up to the configured `pool_timeout`.
    pub async fn acquire(&self) -> EngineResult<ScopedConnection<F>> {
        self.acquire_timeout(self.inner.config.pool_timeout()).await
    }

    /// Check out a connection, waiting up to `timeout`.
    ///
    /// Fails with [`EngineError::PoolExhausted`] when no capacity frees up in
    /// time and with [`EngineError::ConnectionTimeout`] when a new connection
    /// cannot be opened.
    pub async fn acquire_timeout(&self, timeout: Duration) -> EngineResult<ScopedConnection<F>> {
        let inner = &self.inner;
        let started = Instant::now();
        let deadline = started + timeout;

        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(EngineError::ConnectionTimeout("pool is closed".to_string()));
            }
            Err(_) => {
                inner.record_timeout();
                let waited = started.elapsed();
                tracing::warn!(
                    waited_ms = waited.as_millis(),
                    checked_out = inner.counters.checked_out.load(Ordering::SeqCst),
                    capacity = inner.config.capacity(),
                    "Connection pool exhausted"
                );
                return Err(EngineError::PoolExhausted { waited });
            }
        };

        if let Some((conn, created_at)) = self.take_idle(deadline).await {
            return Ok(self.checkout(conn, created_at, permit));
        }

        match tokio::time::timeout_at(deadline, inner.factory.connect()).await {
            Ok(Ok(conn)) => {
                inner.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(store = %inner.factory.describe(), "Opened new connection");
                Ok(self.checkout(conn, Instant::now(), permit))
            }
            Ok(Err(e)) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Failed to open connection");
                Err(EngineError::ConnectionTimeout(format!(
                    "could not open connection: {e}"
                )))
            }
            Err(_) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                inner.record_timeout();
                Err(EngineError::ConnectionTimeout(format!(
                    "connect did not finish within {timeout:?}"
                )))
            }
        }
    }

    /// Pop a usable idle connection, recycling aged ones and dropping those
    /// that fail the pre-ping.
    async fn take_idle(&self, deadline: Instant) -> Option<(F::Connection, Instant)> {
        let inner = &self.inner;
        let recycle_after = inner.config.pool_recycle();

        loop {
            let entry = inner.idle.lock().pop_back()?;

            if entry.created_at.elapsed() >= recycle_after {
                inner.counters.recycled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Recycled aged connection");
                continue;
            }

            if !inner.config.pre_ping {
                return Some((entry.conn, entry.created_at));
            }

            let IdleConnection {
                mut conn,
                created_at,
            } = entry;
            match tokio::time::timeout_at(deadline, conn.ping()).await {
                Ok(Ok(())) => return Some((conn, created_at)),
                Ok(Err(e)) => {
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Discarding connection that failed pre-ping");
                }
                Err(_) => {
                    inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                    inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Discarding connection whose pre-ping timed out");
                    return None;
                }
            }
        }
    }

    fn checkout(
        &self,
        conn: F::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> ScopedConnection<F> {
        self.inner.counters.checkout();
        ScopedConnection {
            conn: Some(conn),
            created_at,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Current metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }

    /// Acquisition timeouts inside the recent window.
    #[must_use]
    pub fn recent_timeouts(&self) -> usize {
        self.inner.recent_timeout_count()
    }

    /// Ping the store with a fresh connection and grade the pool.
    pub async fn health_check(&self) -> HealthReport {
        let inner = &self.inner;
        let started = Instant::now();
        let ping = async {
            let mut conn = inner.factory.connect().await?;
            conn.ping().await
        };

        let (ping_ms, ping_error) =
            match tokio::time::timeout(inner.config.pool_timeout(), ping).await {
                Ok(Ok(())) => (
                    Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)),
                    None,
                ),
                Ok(Err(e)) => (None, Some(e.to_string())),
                Err(_) => (None, Some("ping timed out".to_string())),
            };

        let metrics = inner.metrics();
        let recent_timeouts = inner.recent_timeout_count();
        let (status, issues) = assess(&metrics, recent_timeouts, ping_error.as_deref());

        if status != HealthStatus::Healthy {
            tracing::warn!(%status, ?issues, "Connection pool health degraded");
        }

        HealthReport {
            status,
            issues,
            ping_ms,
            recent_timeouts,
            metrics,
        }
    }

    /// Scaling advisory for the current load. Never applied.
    #[must_use]
    pub fn scaling_recommendation(&self) -> ScalingRecommendation {
        self.inner.recommendation()
    }

    /// Log the scaling advisory periodically when `auto_scale` is set.
    ///
    /// The task stops once every pool handle has been dropped.
    #[must_use]
    pub fn spawn_monitor(&self) -> Option<JoinHandle<()>> {
        if !self.inner.scaling.auto_scale {
            return None;
        }
        let weak: Weak<PoolInner<F>> = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.scaling.monitor_interval_secs.max(1));

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Pool dropped; stopping scaling monitor");
                    break;
                };
                let advice = inner.recommendation();
                if advice.action == ScalingAction::Maintain {
                    tracing::debug!(
                        utilization = advice.utilization,
                        reason = %advice.reason,
                        "Pool size adequate"
                    );
                } else {
                    tracing::info!(
                        action = ?advice.action,
                        current_size = advice.current_size,
                        recommended_size = advice.recommended_size,
                        reason = %advice.reason,
                        "Pool scaling advised"
                    );
                }
            }
        }))
    }
}

/// A checked-out connection. Returns itself to the pool on drop.
pub struct ScopedConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    created_at: Instant,
    pool: Arc<PoolInner<F>>,
    // Released after `Drop::drop` has returned the connection to the idle list.
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> std::fmt::Debug for ScopedConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Deref for ScopedConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> DerefMut for ScopedConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ConnectionFactory> Drop for ScopedConnection<F> {
    fn drop(&mut self) {
        self.pool.counters.checkin();
        let Some(conn) = self.conn.take() else {
            return;
        };

        if conn.in_transaction() {
            self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Discarding connection returned with an open transaction");
            return;
        }

        let mut idle = self.pool.idle.lock();
        if idle.len() >= self.pool.config.pool_size {
            drop(idle);
            self.pool.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Closing overflow connection");
            return;
        }
        idle.push_back(IdleConnection {
            conn,
            created_at: self.created_at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{IsolationLevel, MemoryStore};

    fn pool(store: &MemoryStore, size: usize, overflow: usize) -> ConnectionPoolManager<MemoryStore> {
        let config = PoolConfig {
            pool_size: size,
            max_overflow: overflow,
            pool_timeout_secs: 1,
            ..PoolConfig::default()
        };
        ConnectionPoolManager::new(store.clone(), config, ScalingConfig::default())
    }

    #[tokio::test]
    async fn test_connection_reused_after_release() {
        let store = MemoryStore::default();
        let pool = pool(&store, 2, 0);

        let first_id = pool.acquire().await.unwrap().id();
        let second_id = pool.acquire().await.unwrap().id();

        assert_eq!(first_id, second_id);
        assert_eq!(store.connections_opened(), 1);
        assert_eq!(pool.metrics().acquisitions, 2);
        assert_eq!(pool.metrics().checked_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_times_out() {
        let store = MemoryStore::default();
        let pool = pool(&store, 1, 0);

        let _held = pool.acquire().await.unwrap();
        let err = pool
            .acquire_timeout(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
        assert_eq!(pool.metrics().timeouts, 1);
        assert_eq!(pool.recent_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_overflow_connections_closed_on_return() {
        let store = MemoryStore::default();
        let pool = pool(&store, 1, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_eq!(pool.metrics().overflow, 1);
        assert_eq!(pool.metrics().peak_concurrent, 2);
        drop(a);
        drop(b);

        let metrics = pool.metrics();
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.discarded, 1);
    }

    #[tokio::test]
    async fn test_open_transaction_discarded() {
        let store = MemoryStore::default();
        let pool = pool(&store, 1, 0);

        {
            let mut conn = pool.acquire().await.unwrap();
            conn.begin(IsolationLevel::default()).await.unwrap();
        }

        assert_eq!(pool.metrics().idle, 0);
        assert_eq!(pool.metrics().discarded, 1);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_pre_ping_replaced() {
        let store = MemoryStore::default();
        let pool = pool(&store, 1, 0);
        drop(pool.acquire().await.unwrap());

        store.fail_next_pings(1);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), 2);
        drop(conn);

        let metrics = pool.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.created, 2);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_timeout() {
        let store = MemoryStore::default();
        let pool = pool(&store, 1, 0);
        store.fail_next_connects(1);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectionTimeout(_)));
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_connections_recycled() {
        let store = MemoryStore::default();
        let config = PoolConfig {
            pool_size: 1,
            max_overflow: 0,
            pool_recycle_secs: 10,
            ..PoolConfig::default()
        };
        let pool = ConnectionPoolManager::new(store.clone(), config, ScalingConfig::default());

        drop(pool.acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;
        drop(pool.acquire().await.unwrap());

        assert_eq!(pool.metrics().recycled, 1);
        assert_eq!(store.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = MemoryStore::default();
        let pool = pool(&store, 2, 0);
        assert_eq!(pool.health_check().await.status, HealthStatus::Healthy);

        store.fail_next_connects(1);
        let report = pool.health_check().await;
        assert_eq!(report.status, HealthStatus::Critical);
        assert!(report.ping_ms.is_none());
    }

    #[tokio::test]
    async fn test_monitor_disabled_by_default() {
        let store = MemoryStore::default();
        assert!(pool(&store, 1, 0).spawn_monitor().is_none());
    }
}
