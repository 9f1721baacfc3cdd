//! Approval Engine - Transactional Multi-Step Approval Workflows
//!
//! This crate records approvals and rejections against business entities and
//! drives each entity's workflow through its configured steps. It provides:
//!
//! - **Atomic state transitions**: every vote runs under a row lock inside a
//!   retried transaction, so concurrent approvers never double-advance a step
//! - **Indexed history**: an LRU cache of per-instance views answers "is this
//!   step complete?" without rescanning the history
//! - **Pooled connections**: bounded checkout with health and scaling telemetry
//! - **Admission control**: burst, standard and per-client sliding windows in
//!   front of the write path
//!
//! # Architecture
//!
//! - [`config`]: Layered configuration and validation
//! - [`domain`]: Records, instances, definitions, actors and audit events
//! - [`store`]: Persistent store interface with in-memory and `SQLite` backends
//! - [`pool`]: Connection pool and health reporting
//! - [`transaction`]: Transaction coordinator with classified retries
//! - [`rate_limit`]: Sliding-window rate limiter
//! - [`cache`]: Approval index cache
//! - [`engine`]: The workflow engine
//! - [`context`]: Wiring of all of the above from configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use approval_engine::{EngineConfig, EngineContext, context::load_catalog};
//! use approval_engine::domain::{Actor, EntityKey};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::load()?;
//!     let catalog = load_catalog(&config)?;
//!     let context = EngineContext::in_memory(config, catalog).await?;
//!
//!     let key = EntityKey::new("invoice", "42");
//!     context.engine().create_workflow(&key, "alice", "invoice").await?;
//!     let actor = Actor::new("bob").with_role("manager");
//!     context.engine().approve(&key, &actor, 0, "looks fine").await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub mod rate_limit;
pub mod store;
pub mod transaction;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use engine::{ActionResult, ApprovalOutcome, EngineSettings, WorkflowEngine};
pub use error::{EngineError, EngineResult, ErrorKind};
