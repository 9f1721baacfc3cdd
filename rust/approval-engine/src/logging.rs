//! Structured logging setup and operation timing.

use std::time::Instant;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// is harmless; the second installation is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Operation timer for measuring and logging execution duration.
///
/// ```rust,ignore
/// let timer = OpTimer::new("cache", "rebuild");
/// let view = IndexedApprovalView::build(&history);
/// timer.finish();
/// ```
#[derive(Debug)]
pub struct OpTimer {
    /// Component being timed (e.g. "transaction", "cache").
    component: &'static str,
    /// Operation being performed (e.g. "approve", "rebuild").
    operation: String,
    start: Instant,
}

impl OpTimer {
    /// Start timing an operation.
    #[must_use]
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        let operation = operation.into();

        tracing::trace!(component, operation = %operation, "Operation started");

        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed so far.
    #[must_use]
    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }

    /// Finish the timer and log the duration at debug level.
    pub fn finish(self) {
        tracing::debug!(
            component = self.component,
            operation = %self.operation,
            duration_ms = self.elapsed_ms(),
            "Operation completed"
        );
    }

    /// Finish the timer, logging success or the error.
    pub fn finish_with_result<T, E: std::fmt::Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.elapsed_ms();

        match result {
            Ok(_) => {
                tracing::debug!(
                    component = self.component,
                    operation = %self.operation,
                    duration_ms,
                    "Operation completed successfully"
                );
            }
            Err(e) => {
                tracing::warn!(
                    component = self.component,
                    operation = %self.operation,
                    duration_ms,
                    error = %e,
                    "Operation failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_timer_creation() {
        let timer = OpTimer::new("cache", "rebuild");
        assert_eq!(timer.component, "cache");
        assert_eq!(timer.operation, "rebuild");
    }

    #[test]
    fn test_op_timer_finish_with_result() {
        let ok: Result<i32, String> = Ok(1);
        OpTimer::new("transaction", "approve").finish_with_result(ok.as_ref());

        let err: Result<i32, String> = Err("deadlock".to_string());
        OpTimer::new("transaction", "approve").finish_with_result(err.as_ref());
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
