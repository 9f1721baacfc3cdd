//! Explicit wiring of every engine component.
//!
//! An [`EngineContext`] is built once at startup from [`EngineConfig`] and
//! handed to whatever needs the engine. Nothing in the crate keeps global
//! state, so tests build as many independent contexts as they like.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::task::JoinHandle;

use crate::cache::ApprovalIndexCache;
use crate::config::EngineConfig;
use crate::domain::DefinitionCatalog;
use crate::engine::{EngineSettings, WorkflowEngine};
use crate::pool::{ConnectionPoolManager, HealthReport};
use crate::rate_limit::RateLimiter;
use crate::store::{ConnectionFactory, MemoryStore};
use crate::transaction::TransactionCoordinator;

/// Fully wired engine components.
pub struct EngineContext<F: ConnectionFactory> {
    config: EngineConfig,
    pool: ConnectionPoolManager<F>,
    engine: WorkflowEngine<F>,
}

impl<F: ConnectionFactory> std::fmt::Debug for EngineContext<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("pool", &self.pool)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> EngineContext<F> {
    /// Wire components over `factory`.
    pub async fn build(
        config: EngineConfig,
        factory: F,
        catalog: DefinitionCatalog,
    ) -> anyhow::Result<Self> {
        let pool = ConnectionPoolManager::new(factory, config.pool.clone(), config.scaling.clone());
        let coordinator = Arc::new(TransactionCoordinator::new(pool.clone(), &config.transaction));
        let limiter = RateLimiter::from_config(config.rate_limit.clone())
            .await
            .context("Failed to initialise rate limiter")?;
        let cache = Arc::new(ApprovalIndexCache::new(&config.cache));

        if catalog.is_empty() {
            tracing::warn!("Engine started with an empty workflow catalog");
        }
        let engine = WorkflowEngine::new(
            coordinator,
            limiter,
            cache,
            Arc::new(catalog),
            EngineSettings::from_config(&config),
        );

        tracing::info!(
            store = %pool.factory().describe(),
            workflows = engine.catalog().len(),
            "Approval engine ready"
        );
        Ok(Self {
            config,
            pool,
            engine,
        })
    }

    /// Configuration the context was built from.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The workflow engine.
    pub fn engine(&self) -> &WorkflowEngine<F> {
        &self.engine
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPoolManager<F> {
        &self.pool
    }

    /// Ping the store and grade pool telemetry.
    pub async fn health(&self) -> HealthReport {
        self.pool.health_check().await
    }

    /// Start the rate-limit sweeper and, when auto-scaling advice is
    /// enabled, the pool monitor. The tasks stop once the context is dropped.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.engine.limiter().spawn_sweeper()];
        tasks.extend(self.pool.spawn_monitor());
        tasks
    }
}

impl EngineContext<MemoryStore> {
    /// Context over a fresh in-memory store.
    pub async fn in_memory(config: EngineConfig, catalog: DefinitionCatalog) -> anyhow::Result<Self> {
        let store = MemoryStore::new(config.store.lock_wait_timeout());
        Self::build(config, store, catalog).await
    }
}

#[cfg(feature = "sqlite")]
impl EngineContext<crate::store::SqliteStore> {
    /// Context over the configured `SQLite` database.
    pub async fn sqlite(config: EngineConfig, catalog: DefinitionCatalog) -> anyhow::Result<Self> {
        let path = config
            .store
            .sqlite_path
            .clone()
            .context("store.sqlite_path is required for the sqlite backend")?;
        let store = crate::store::SqliteStore::open(&path, config.store.lock_wait_timeout())
            .await
            .with_context(|| format!("Failed to open SQLite store at {path}"))?;
        Self::build(config, store, catalog).await
    }
}

/// Load the catalog named by `config.catalog.definitions_path`, or an empty
/// one when no path is configured.
pub fn load_catalog(config: &EngineConfig) -> anyhow::Result<DefinitionCatalog> {
    match config.catalog.definitions_path.as_deref() {
        Some(path) => DefinitionCatalog::load(path)
            .with_context(|| format!("Failed to load workflow definitions from {path}")),
        None => Ok(DefinitionCatalog::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Actor, EntityKey, StepConfig, WorkflowDefinition};
    use crate::pool::HealthStatus;

    fn catalog() -> DefinitionCatalog {
        DefinitionCatalog::from_definitions([WorkflowDefinition::new(
            "memo",
            vec![StepConfig::new("review", "reviewer")],
        )])
        .unwrap()
    }

    #[tokio::test]
    async fn test_in_memory_context_runs_engine() {
        let context = EngineContext::in_memory(EngineConfig::default(), catalog())
            .await
            .unwrap();
        let key = EntityKey::new("memo", "1");
        context
            .engine()
            .create_workflow(&key, "author", "memo")
            .await
            .unwrap();
        let outcome = context
            .engine()
            .approve(&key, &Actor::new("r").with_role("reviewer"), 0, "")
            .await
            .unwrap();
        assert!(outcome.workflow_completed);

        let report = context.health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_contexts_are_independent() {
        let a = EngineContext::in_memory(EngineConfig::default(), catalog())
            .await
            .unwrap();
        let b = EngineContext::in_memory(EngineConfig::default(), catalog())
            .await
            .unwrap();
        let key = EntityKey::new("memo", "1");
        a.engine().create_workflow(&key, "author", "memo").await.unwrap();
        assert!(b.engine().get_instance(&key).await.is_err());
    }

    #[test]
    fn test_empty_catalog_without_path() {
        assert!(load_catalog(&EngineConfig::default()).unwrap().is_empty());
    }
}
