//! Pool counters, health assessment and the scaling advisory.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::ScalingConfig;

/// Utilization above which the pool reports a warning.
pub const UTILIZATION_WARNING_PERCENT: f64 = 90.0;

/// Connection failure rate above which the pool reports critical.
pub const FAILURE_RATE_CRITICAL: f64 = 0.05;

/// Live counters updated by the pool.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) checked_out: AtomicUsize,
    pub(crate) created: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) peak_concurrent: AtomicUsize,
    pub(crate) acquisitions: AtomicU64,
    pub(crate) recycled: AtomicU64,
    pub(crate) discarded: AtomicU64,
}

impl PoolCounters {
    /// Mark one checkout and update the peak.
    pub(crate) fn checkout(&self) {
        let now = self.checked_out.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn checkin(&self) {
        self.checked_out.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self, pool_size: usize, max_overflow: usize, idle: usize) -> PoolMetrics {
        let checked_out = self.checked_out.load(Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss, reason = "pool sizes are small")]
        let utilization_percent = if pool_size == 0 {
            0.0
        } else {
            checked_out as f64 / pool_size as f64 * 100.0
        };

        PoolMetrics {
            pool_size,
            max_overflow,
            checked_out,
            idle,
            overflow: checked_out.saturating_sub(pool_size),
            created: self.created.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            peak_concurrent: self.peak_concurrent.load(Ordering::SeqCst),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            utilization_percent,
        }
    }
}

/// Point-in-time pool metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    /// Configured steady-state size.
    pub pool_size: usize,
    /// Extra connections allowed under load.
    pub max_overflow: usize,
    /// Connections currently handed out.
    pub checked_out: usize,
    /// Connections waiting in the pool.
    pub idle: usize,
    /// Checked-out connections beyond `pool_size`.
    pub overflow: usize,
    /// Connections opened.
    pub created: u64,
    /// Failed connects and failed pre-pings.
    pub failed: u64,
    /// Acquisitions that gave up waiting.
    pub timeouts: u64,
    /// Highest concurrent checkout seen.
    pub peak_concurrent: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Idle connections replaced for age.
    pub recycled: u64,
    /// Connections dropped instead of returned.
    pub discarded: u64,
    /// `checked_out / pool_size` as a percentage; exceeds 100 under overflow.
    pub utilization_percent: f64,
}

impl PoolMetrics {
    /// Utilization as a fraction.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.utilization_percent / 100.0
    }

    /// Share of connection attempts (opens and pre-pings) that failed.
    #[must_use]
    #[allow(clippy::cast_precision_loss, reason = "counters stay far below 2^52")]
    pub fn failure_rate(&self) -> f64 {
        let attempts = self.acquisitions + self.failed;
        if attempts == 0 {
            0.0
        } else {
            self.failed as f64 / attempts as f64
        }
    }
}

/// Overall pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Nothing to report.
    Healthy,
    /// Degraded but serving.
    Warning,
    /// Failing.
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        })
    }
}

/// Result of a pool health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among all findings.
    pub status: HealthStatus,
    /// Human readable findings.
    pub issues: Vec<String>,
    /// Round-trip time of the ping query.
    pub ping_ms: Option<u64>,
    /// Timeouts inside the recent window.
    pub recent_timeouts: usize,
    /// Metrics at the time of the check.
    pub metrics: PoolMetrics,
}

/// Grade pool metrics.
#[must_use]
pub fn assess(
    metrics: &PoolMetrics,
    recent_timeouts: usize,
    ping_error: Option<&str>,
) -> (HealthStatus, Vec<String>) {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    if let Some(error) = ping_error {
        status = HealthStatus::Critical;
        issues.push(format!("ping query failed: {error}"));
    }

    let failure_rate = metrics.failure_rate();
    if failure_rate > FAILURE_RATE_CRITICAL {
        status = HealthStatus::Critical;
        issues.push(format!(
            "connection failure rate {:.1}% exceeds {:.0}%",
            failure_rate * 100.0,
            FAILURE_RATE_CRITICAL * 100.0
        ));
    }

    if metrics.utilization_percent > UTILIZATION_WARNING_PERCENT {
        status = status.max(HealthStatus::Warning);
        issues.push(format!(
            "utilization {:.1}% exceeds {UTILIZATION_WARNING_PERCENT:.0}%",
            metrics.utilization_percent
        ));
    }

    if recent_timeouts > 0 {
        status = status.max(HealthStatus::Warning);
        issues.push(format!("{recent_timeouts} acquisition timeout(s) in recent window"));
    }

    (status, issues)
}

/// Advised change to the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Grow the pool.
    ScaleUp,
    /// Shrink the pool.
    ScaleDown,
    /// Leave it alone.
    Maintain,
}

/// Scaling advisory. Never applied automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRecommendation {
    /// What to do.
    pub action: ScalingAction,
    /// Current configured size.
    pub current_size: usize,
    /// Suggested size.
    pub recommended_size: usize,
    /// Utilization fraction the advice is based on.
    pub utilization: f64,
    /// Timeouts inside the recent window.
    pub recent_timeouts: usize,
    /// Why.
    pub reason: String,
}

/// Compute the scaling advisory.
#[must_use]
pub fn recommend(
    scaling: &ScalingConfig,
    current_size: usize,
    utilization: f64,
    recent_timeouts: usize,
) -> ScalingRecommendation {
    let maintain = |reason: String| ScalingRecommendation {
        action: ScalingAction::Maintain,
        current_size,
        recommended_size: current_size,
        utilization,
        recent_timeouts,
        reason,
    };

    if utilization >= scaling.scale_up_threshold && recent_timeouts > 0 {
        let target = (current_size + (current_size / 2).max(1)).min(scaling.max_pool_size);
        if target <= current_size {
            return maintain(format!(
                "under pressure but already at max_pool_size {}",
                scaling.max_pool_size
            ));
        }
        return ScalingRecommendation {
            action: ScalingAction::ScaleUp,
            current_size,
            recommended_size: target,
            utilization,
            recent_timeouts,
            reason: format!(
                "utilization {:.0}% with {recent_timeouts} recent timeout(s)",
                utilization * 100.0
            ),
        };
    }

    if utilization <= scaling.scale_down_threshold && recent_timeouts == 0 {
        let target = current_size
            .saturating_sub((current_size / 4).max(1))
            .max(scaling.min_pool_size);
        if target >= current_size {
            return maintain(format!(
                "idle but already at min_pool_size {}",
                scaling.min_pool_size
            ));
        }
        return ScalingRecommendation {
            action: ScalingAction::ScaleDown,
            current_size,
            recommended_size: target,
            utilization,
            recent_timeouts,
            reason: format!("utilization {:.0}% with no recent timeouts", utilization * 100.0),
        };
    }

    maintain("utilization within thresholds".to_string())
}
