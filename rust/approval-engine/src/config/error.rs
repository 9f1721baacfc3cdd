//! Configuration error types with actionable messages.
//!
//! Every variant carries enough context for an operator to locate the
//! offending option and the environment variable or file key that sets it.

use std::fmt;

/// Configuration errors with detailed, actionable messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A single option holds an unusable value.
    Invalid {
        /// Dotted option path (e.g. `pool.pool_size`).
        option: String,
        /// What is wrong.
        message: String,
        /// How to fix it.
        fix_hint: String,
    },
    /// Two options whose values contradict each other.
    Incompatible {
        /// First option.
        option1: String,
        /// Second option.
        option2: String,
        /// Why they contradict.
        reason: String,
    },
    /// An option required by another option is missing.
    MissingRequired {
        /// The missing option.
        option: String,
        /// What requires it.
        context: String,
        /// Environment variable that sets it.
        env_var: String,
    },
    /// Multiple errors occurred.
    Multiple(Vec<ConfigurationError>),
}

impl std::error::Error for ConfigurationError {}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid {
                option,
                message,
                fix_hint,
            } => {
                write!(
                    f,
                    "Invalid configuration for {option}: {message}\n\nHow to fix: {fix_hint}"
                )
            }
            Self::Incompatible {
                option1,
                option2,
                reason,
            } => {
                write!(
                    f,
                    "Incompatible settings: {option1} conflicts with {option2}\n\n\
                    Reason: {reason}"
                )
            }
            Self::MissingRequired {
                option,
                context,
                env_var,
            } => {
                write!(
                    f,
                    "Missing required configuration: {option}\n\n\
                    Required for: {context}\n\
                    Set via: {env_var}"
                )
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple configuration errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "\n{}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl ConfigurationError {
    /// Create an invalid option error.
    #[must_use]
    pub fn invalid(
        option: impl Into<String>,
        message: impl Into<String>,
        fix_hint: impl Into<String>,
    ) -> Self {
        Self::Invalid {
            option: option.into(),
            message: message.into(),
            fix_hint: fix_hint.into(),
        }
    }

    /// Create an incompatible options error.
    #[must_use]
    pub fn incompatible(
        option1: impl Into<String>,
        option2: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Incompatible {
            option1: option1.into(),
            option2: option2.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing required option error.
    #[must_use]
    pub fn missing_required(
        option: impl Into<String>,
        context: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self::MissingRequired {
            option: option.into(),
            context: context.into(),
            env_var: env_var.into(),
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the lone error when
    /// there is exactly one, `Multiple` otherwise.
    pub fn collect(mut errors: Vec<ConfigurationError>) -> ConfigResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }

    /// Get the number of errors (1 for single errors, N for multiple).
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Multiple(errors) => errors.len(),
            _ => 1,
        }
    }
}

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigurationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_error_display() {
        let err = ConfigurationError::invalid(
            "pool.pool_size",
            "must be greater than zero",
            "Set APPROVAL__POOL__POOL_SIZE to a positive integer",
        );
        let msg = err.to_string();
        assert!(msg.contains("Invalid configuration"));
        assert!(msg.contains("pool.pool_size"));
        assert!(msg.contains("How to fix"));
    }

    #[test]
    fn test_incompatible_error_display() {
        let err = ConfigurationError::incompatible(
            "scaling.scale_down_threshold=0.9",
            "scaling.scale_up_threshold=0.8",
            "the scale-down threshold must sit below the scale-up threshold",
        );
        let msg = err.to_string();
        assert!(msg.contains("Incompatible"));
        assert!(msg.contains("scale_down_threshold"));
    }

    #[test]
    fn test_missing_required_error_display() {
        let err = ConfigurationError::missing_required(
            "rate_limit.redis_url",
            "Redis-backed rate limiting",
            "APPROVAL__RATE_LIMIT__REDIS_URL",
        );
        let msg = err.to_string();
        assert!(msg.contains("Missing required"));
        assert!(msg.contains("APPROVAL__RATE_LIMIT__REDIS_URL"));
    }

    #[test]
    fn test_collect() {
        assert!(ConfigurationError::collect(vec![]).is_ok());

        let single = ConfigurationError::collect(vec![ConfigurationError::invalid("a", "b", "c")])
            .unwrap_err();
        assert_eq!(single.count(), 1);

        let many = ConfigurationError::collect(vec![
            ConfigurationError::invalid("a", "b", "c"),
            ConfigurationError::invalid("d", "e", "f"),
        ])
        .unwrap_err();
        assert_eq!(many.count(), 2);
        let msg = many.to_string();
        assert!(msg.contains("Multiple configuration errors"));
        assert!(msg.contains("1."));
        assert!(msg.contains("2."));
    }
}
