//! Cross-field configuration validation.
//!
//! Serde guarantees each option parses; the validator checks that the
//! options make sense together and reports every problem at once.

use super::error::{ConfigResult, ConfigurationError};
use super::{
    EngineConfig, PoolConfig, RateLimitConfig, ScalingConfig, StoreBackend, StoreConfig,
    TransactionConfig, WindowBackend, WindowConfig,
};

/// Validates an [`EngineConfig`] before any component is constructed.
#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire configuration.
    pub fn validate(config: &EngineConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();

        Self::validate_pool(&config.pool, &mut errors);
        Self::validate_scaling(&config.scaling, &config.pool, &mut errors);
        Self::validate_transaction(&config.transaction, &mut errors);
        Self::validate_rate_limit(&config.rate_limit, &mut errors);
        Self::validate_store(&config.store, &mut errors);

        if config.cache.capacity == 0 {
            errors.push(ConfigurationError::invalid(
                "cache.capacity",
                "must hold at least one view",
                "Set APPROVAL__CACHE__CAPACITY to a positive integer",
            ));
        }
        if config.security.max_comment_length == 0 {
            errors.push(ConfigurationError::invalid(
                "security.max_comment_length",
                "must be greater than zero",
                "Set APPROVAL__SECURITY__MAX_COMMENT_LENGTH (default 1000)",
            ));
        }

        ConfigurationError::collect(errors)
    }

    fn validate_pool(pool: &PoolConfig, errors: &mut Vec<ConfigurationError>) {
        if pool.pool_size == 0 {
            errors.push(ConfigurationError::invalid(
                "pool.pool_size",
                "must be greater than zero",
                "Set APPROVAL__POOL__POOL_SIZE to a positive integer",
            ));
        }
        if pool.pool_timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "pool.pool_timeout_secs",
                "a zero timeout fails every contended acquisition",
                "Set APPROVAL__POOL__POOL_TIMEOUT_SECS to at least 1",
            ));
        }
    }

    fn validate_scaling(
        scaling: &ScalingConfig,
        pool: &PoolConfig,
        errors: &mut Vec<ConfigurationError>,
    ) {
        if scaling.min_pool_size > scaling.max_pool_size {
            errors.push(ConfigurationError::incompatible(
                format!("scaling.min_pool_size={}", scaling.min_pool_size),
                format!("scaling.max_pool_size={}", scaling.max_pool_size),
                "the minimum pool size exceeds the maximum",
            ));
        } else if pool.pool_size < scaling.min_pool_size || pool.pool_size > scaling.max_pool_size
        {
            errors.push(ConfigurationError::incompatible(
                format!("pool.pool_size={}", pool.pool_size),
                format!(
                    "scaling bounds [{}, {}]",
                    scaling.min_pool_size, scaling.max_pool_size
                ),
                "the configured pool size lies outside the scaling bounds",
            ));
        }

        for (name, value) in [
            ("scaling.scale_up_threshold", scaling.scale_up_threshold),
            ("scaling.scale_down_threshold", scaling.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(ConfigurationError::invalid(
                    name,
                    format!("{value} is not a utilization ratio"),
                    "Use a value between 0.0 and 1.0",
                ));
            }
        }
        if scaling.scale_down_threshold >= scaling.scale_up_threshold {
            errors.push(ConfigurationError::incompatible(
                format!("scaling.scale_down_threshold={}", scaling.scale_down_threshold),
                format!("scaling.scale_up_threshold={}", scaling.scale_up_threshold),
                "the scale-down threshold must sit below the scale-up threshold",
            ));
        }
    }

    fn validate_transaction(tx: &TransactionConfig, errors: &mut Vec<ConfigurationError>) {
        if tx.base_delay_ms > tx.max_delay_ms {
            errors.push(ConfigurationError::incompatible(
                format!("transaction.base_delay_ms={}", tx.base_delay_ms),
                format!("transaction.max_delay_ms={}", tx.max_delay_ms),
                "the first backoff delay exceeds the backoff ceiling",
            ));
        }
        if tx.timeout_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "transaction.timeout_secs",
                "every unit of work would time out immediately",
                "Set APPROVAL__TRANSACTION__TIMEOUT_SECS to at least 1",
            ));
        }
        if tx.bulk_chunk_size == 0 {
            errors.push(ConfigurationError::invalid(
                "transaction.bulk_chunk_size",
                "must be greater than zero",
                "Set APPROVAL__TRANSACTION__BULK_CHUNK_SIZE (default 50)",
            ));
        }
    }

    fn validate_rate_limit(rate: &RateLimitConfig, errors: &mut Vec<ConfigurationError>) {
        let tiers: [(&str, WindowConfig); 3] = [
            ("rate_limit.burst", rate.burst),
            ("rate_limit.standard", rate.standard),
            ("rate_limit.client", rate.client),
        ];
        for (name, window) in tiers {
            if window.window_secs == 0 || window.max_requests == 0 {
                errors.push(ConfigurationError::invalid(
                    name,
                    "window length and threshold must both be positive",
                    "Set window_secs and max_requests to positive integers",
                ));
            }
        }
        if rate.global_per_second == Some(0) {
            errors.push(ConfigurationError::invalid(
                "rate_limit.global_per_second",
                "a zero ceiling rejects every request",
                "Remove the option to disable the global ceiling",
            ));
        }
        if rate.backend == WindowBackend::Redis && rate.redis_url.is_none() {
            errors.push(ConfigurationError::missing_required(
                "rate_limit.redis_url",
                "Redis-backed rate limiting",
                "APPROVAL__RATE_LIMIT__REDIS_URL or REDIS_URL",
            ));
        }
    }

    fn validate_store(store: &StoreConfig, errors: &mut Vec<ConfigurationError>) {
        if store.backend == StoreBackend::Sqlite && store.sqlite_path.is_none() {
            errors.push(ConfigurationError::missing_required(
                "store.sqlite_path",
                "the SQLite store backend",
                "APPROVAL__STORE__SQLITE_PATH",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConfigValidator::validate(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = EngineConfig::default();
        config.scaling.scale_down_threshold = 0.9;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("scale-down threshold"));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = EngineConfig::default();
        config.pool.pool_size = 0;
        config.transaction.base_delay_ms = 10_000;
        config.rate_limit.backend = WindowBackend::Redis;
        config.store.backend = StoreBackend::Sqlite;

        let err = ConfigValidator::validate(&config).unwrap_err();
        // pool size, scaling bounds, backoff, redis url, sqlite path
        assert_eq!(err.count(), 5);
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = EngineConfig::default();
        config.rate_limit.client.max_requests = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("rate_limit.client"));
    }
}
