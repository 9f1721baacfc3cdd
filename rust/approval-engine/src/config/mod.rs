//! Configuration management for the approval engine.
//!
//! Configuration is layered: serde defaults, then an optional
//! `config/approval-engine.{yaml,toml,json}` file, then environment variables
//! prefixed with `APPROVAL` using `__` as the section separator
//! (e.g. `APPROVAL__POOL__POOL_SIZE=20`).
//!
//! ```rust,ignore
//! use approval_engine::config::{ConfigValidator, EngineConfig};
//!
//! let config = EngineConfig::load()?;
//! ConfigValidator::validate(&config)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::IsolationLevel;
use crate::transaction::BackoffStrategy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Connection pool sizing and lifetime.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Pool scaling advisory thresholds.
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Retry, backoff and isolation settings.
    #[serde(default)]
    pub transaction: TransactionConfig,
    /// Admission control tiers.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Approval index cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Persistent store backend.
    #[serde(default)]
    pub store: StoreConfig,
    /// Record integrity, comment bounds and auditing.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Workflow definition catalog location.
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from files and environment, then validate it.
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::load_unchecked()?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration, reading `path` instead of the default file
    /// location when given.
    pub fn load_from(path: Option<&str>) -> anyhow::Result<Self> {
        // A missing .env file is normal outside development.
        let _ = dotenvy::dotenv();

        let file = path.unwrap_or("config/approval-engine");
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix("APPROVAL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut engine_config: EngineConfig = settings.try_deserialize()?;

        if let Ok(url) = std::env::var("REDIS_URL") {
            engine_config.rate_limit.redis_url.get_or_insert(url);
        }
        if let Ok(secret) = std::env::var("APPROVAL_INTEGRITY_SECRET") {
            engine_config.security.integrity_secret = Some(secret);
        }

        Ok(engine_config)
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Additional connections allowed beyond `pool_size` under load.
    #[serde(default = "default_max_overflow")]
    pub max_overflow: usize,
    /// Seconds to wait for a free connection.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,
    /// Seconds after which an idle connection is replaced.
    #[serde(default = "default_pool_recycle")]
    pub pool_recycle_secs: u64,
    /// Ping idle connections before handing them out.
    #[serde(default = "default_true")]
    pub pre_ping: bool,
}

fn default_pool_size() -> usize {
    5
}

fn default_max_overflow() -> usize {
    10
}

fn default_pool_timeout() -> u64 {
    30
}

fn default_pool_recycle() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    /// Acquisition timeout.
    #[must_use]
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_timeout_secs)
    }

    /// Maximum idle lifetime of a connection.
    #[must_use]
    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle_secs)
    }

    /// Hard ceiling on simultaneously checked-out connections.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.pool_size + self.max_overflow
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_overflow: default_max_overflow(),
            pool_timeout_secs: default_pool_timeout(),
            pool_recycle_secs: default_pool_recycle(),
            pre_ping: true,
        }
    }
}

/// Pool scaling advisory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Periodically log scaling advice. Advice is never applied.
    #[serde(default)]
    pub auto_scale: bool,
    /// Lower bound for scale-down advice.
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,
    /// Upper bound for scale-up advice.
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Utilization ratio at or above which scale-up is considered.
    #[serde(default = "default_scale_up")]
    pub scale_up_threshold: f64,
    /// Utilization ratio at or below which scale-down is considered.
    #[serde(default = "default_scale_down")]
    pub scale_down_threshold: f64,
    /// Seconds of timeout history considered "recent".
    #[serde(default = "default_recent_window")]
    pub recent_window_secs: u64,
    /// Seconds between advisory log lines when `auto_scale` is set.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

fn default_min_pool_size() -> usize {
    2
}

fn default_max_pool_size() -> usize {
    50
}

fn default_scale_up() -> f64 {
    0.8
}

fn default_scale_down() -> f64 {
    0.3
}

fn default_recent_window() -> u64 {
    300
}

fn default_monitor_interval() -> u64 {
    60
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            auto_scale: false,
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            scale_up_threshold: default_scale_up(),
            scale_down_threshold: default_scale_down(),
            recent_window_secs: default_recent_window(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

/// Transaction retry and isolation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Retries allowed for optimistic-lock conflicts.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retries allowed for deadlock-like failures.
    #[serde(default = "default_deadlock_retries")]
    pub deadlock_retry_attempts: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Wall-clock ceiling for a whole unit of work, retries included.
    #[serde(default = "default_tx_timeout")]
    pub timeout_secs: u64,
    /// Isolation used when an operation does not ask for one.
    #[serde(default)]
    pub isolation_level: IsolationLevel,
    /// Backoff growth.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Operations per transaction for bulk processing.
    #[serde(default = "default_chunk_size")]
    pub bulk_chunk_size: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_deadlock_retries() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    5_000
}

fn default_tx_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    50
}

impl TransactionConfig {
    /// First backoff delay.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff ceiling.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Wall-clock ceiling.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            deadlock_retry_attempts: default_deadlock_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            timeout_secs: default_tx_timeout(),
            isolation_level: IsolationLevel::default(),
            backoff: BackoffStrategy::default(),
            bulk_chunk_size: default_chunk_size(),
        }
    }
}

/// One sliding window: at most `max_requests` within `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length in seconds.
    pub window_secs: u64,
    /// Admissions allowed within the window.
    pub max_requests: u32,
}

impl WindowConfig {
    /// Window length.
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Backend holding sliding-window counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowBackend {
    /// Process-local counters.
    #[default]
    Memory,
    /// Redis sorted sets shared across processes.
    Redis,
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Short window, low threshold, keyed by subject.
    #[serde(default = "default_burst")]
    pub burst: WindowConfig,
    /// Medium window keyed by subject.
    #[serde(default = "default_standard")]
    pub standard: WindowConfig,
    /// Long window keyed by client fingerprint.
    #[serde(default = "default_client")]
    pub client: WindowConfig,
    /// Seconds between sweeps of expired entries.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Optional process-wide ceiling checked before the windows.
    #[serde(default)]
    pub global_per_second: Option<u32>,
    /// Counter backend.
    #[serde(default)]
    pub backend: WindowBackend,
    /// Redis URL for the `redis` backend.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Admit requests when the counter backend is unreachable.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

fn default_burst() -> WindowConfig {
    WindowConfig {
        window_secs: 60,
        max_requests: 5,
    }
}

fn default_standard() -> WindowConfig {
    WindowConfig {
        window_secs: 300,
        max_requests: 10,
    }
}

fn default_client() -> WindowConfig {
    WindowConfig {
        window_secs: 900,
        max_requests: 100,
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitConfig {
    /// The largest configured window; entries older than this are garbage.
    #[must_use]
    pub fn largest_window(&self) -> Duration {
        [self.burst, self.standard, self.client]
            .iter()
            .map(WindowConfig::window)
            .max()
            .unwrap_or_default()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            standard: default_standard(),
            client: default_client(),
            sweep_interval_secs: default_sweep_interval(),
            global_per_second: None,
            backend: WindowBackend::default(),
            redis_url: None,
            fail_open: true,
        }
    }
}

/// Approval index cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Age ceiling for a cached view, in minutes.
    #[serde(default = "default_cache_age")]
    pub cache_max_age_minutes: u64,
    /// Maximum number of cached views.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_age() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    1024
}

impl CacheConfig {
    /// Age ceiling.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_minutes * 60)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_max_age_minutes: default_cache_age(),
            capacity: default_cache_capacity(),
        }
    }
}

/// Persistent store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store, lost on exit.
    #[default]
    Memory,
    /// `SQLite` database file.
    Sqlite,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend.
    #[serde(default)]
    pub sqlite_path: Option<String>,
    /// How long a row-lock request waits before failing as deadlock-like.
    #[serde(default = "default_lock_wait")]
    pub lock_wait_timeout_ms: u64,
}

fn default_lock_wait() -> u64 {
    5_000
}

impl StoreConfig {
    /// Row-lock wait ceiling.
    #[must_use]
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: None,
            lock_wait_timeout_ms: default_lock_wait(),
        }
    }
}

/// Integrity, sanitization and audit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Secret from which the record integrity key is derived.
    #[serde(default)]
    pub integrity_secret: Option<String>,
    /// Maximum comment length in characters after sanitization.
    #[serde(default = "default_max_comment")]
    pub max_comment_length: usize,
    /// Append a security event for every state-changing action.
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

fn default_max_comment() -> usize {
    1_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            integrity_secret: None,
            max_comment_length: default_max_comment(),
            audit_enabled: true,
        }
    }
}

/// Workflow definition catalog configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// YAML or JSON file listing workflow definitions.
    #[serde(default)]
    pub definitions_path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.transaction.max_retries, 3);
        assert_eq!(config.transaction.deadlock_retry_attempts, 5);
        assert_eq!(config.rate_limit.burst.window_secs, 60);
        assert_eq!(config.rate_limit.burst.max_requests, 5);
        assert_eq!(config.rate_limit.standard.max_requests, 10);
        assert_eq!(config.rate_limit.client.window_secs, 900);
        assert!((config.scaling.scale_up_threshold - 0.8).abs() < f64::EPSILON);
        assert!((config.scaling.scale_down_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.transaction.isolation_level, IsolationLevel::ReadCommitted);
    }

    #[test]
    fn test_largest_window() {
        let config = RateLimitConfig::default();
        assert_eq!(config.largest_window(), Duration::from_secs(900));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
pool:
  pool_size: 20
rate_limit:
  burst:
    window_secs: 10
    max_requests: 2
";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.pool_size, 20);
        assert_eq!(config.pool.max_overflow, 10);
        assert_eq!(config.rate_limit.burst.max_requests, 2);
        assert_eq!(config.rate_limit.standard.max_requests, 10);
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        // SAFETY: serialized with the other environment-mutating tests.
        unsafe {
            std::env::set_var("APPROVAL__POOL__POOL_SIZE", "17");
            std::env::set_var("APPROVAL__TRANSACTION__MAX_RETRIES", "7");
        }
        let config = EngineConfig::load_unchecked().unwrap();
        // SAFETY: as above.
        unsafe {
            std::env::remove_var("APPROVAL__POOL__POOL_SIZE");
            std::env::remove_var("APPROVAL__TRANSACTION__MAX_RETRIES");
        }
        assert_eq!(config.pool.pool_size, 17);
        assert_eq!(config.transaction.max_retries, 7);
    }
}
