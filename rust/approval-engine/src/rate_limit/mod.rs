//! Multi-tier admission control for the approval write path.
//!
//! Three sliding windows guard every vote: `burst` and `standard` keyed by
//! actor id, `client` keyed by a fingerprint of the request origin. A request
//! is admitted only when all three have room, and is then recorded in all
//! three. An optional governor quota caps the whole process before any window
//! is consulted.

mod clock;
mod fingerprint;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{best_origin, client_fingerprint};
#[cfg(feature = "redis-store")]
pub use store::RedisWindowStore;
pub use store::{InMemoryWindowStore, WindowCheck, WindowDecision, WindowStore, WindowStoreError};

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};
use std::time::Duration;

use governor::clock::{Clock as _, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::config::{RateLimitConfig, WindowBackend, WindowConfig};
use crate::domain::Actor;
use crate::error::{EngineError, EngineResult};

/// Which guard refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    /// Process-wide quota.
    Global,
    /// Short window per actor.
    Burst,
    /// Medium window per actor.
    Standard,
    /// Long window per client fingerprint.
    Client,
}

impl RateLimitTier {
    /// Stable label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Burst => "burst",
            Self::Standard => "standard",
            Self::Client => "client",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const WINDOW_TIERS: [RateLimitTier; 3] = [
    RateLimitTier::Burst,
    RateLimitTier::Standard,
    RateLimitTier::Client,
];

struct LimiterInner {
    config: RateLimitConfig,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    global: Option<DefaultDirectRateLimiter>,
}

impl LimiterInner {
    fn checks(&self, actor: &Actor) -> [WindowCheck; 3] {
        let subject = actor.authenticated.then_some(actor.id.as_str());
        let fingerprint = client_fingerprint(&actor.origin, subject);
        let window = |key: String, tier: &WindowConfig| WindowCheck {
            key,
            window: tier.window(),
            limit: tier.max_requests,
        };
        [
            window(format!("burst:{}", actor.id), &self.config.burst),
            window(format!("standard:{}", actor.id), &self.config.standard),
            window(format!("client:{fingerprint}"), &self.config.client),
        ]
    }

    async fn sweep(&self) -> Result<usize, WindowStoreError> {
        let cutoff = self
            .clock
            .now()
            .saturating_sub(self.config.largest_window());
        self.store.purge_before(cutoff).await
    }
}

/// Sliding-window rate limiter.
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.inner.store)
            .field("global", &self.inner.config.global_per_second)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build a limiter over an explicit store and clock.
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn WindowStore>, clock: Arc<dyn Clock>) -> Self {
        let global = config
            .global_per_second
            .and_then(NonZeroU32::new)
            .map(|per_second| governor::RateLimiter::direct(Quota::per_second(per_second)));

        Self {
            inner: Arc::new(LimiterInner {
                config,
                store,
                clock,
                global,
            }),
        }
    }

    /// Process-local windows on the system clock.
    #[must_use]
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Process-local windows on the given clock.
    #[must_use]
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config, Arc::new(InMemoryWindowStore::new()), clock)
    }

    /// Build the limiter the configuration asks for, connecting to Redis when
    /// the `redis` backend is selected.
    pub async fn from_config(config: RateLimitConfig) -> Result<Self, WindowStoreError> {
        match config.backend {
            WindowBackend::Memory => Ok(Self::in_memory(config)),
            #[cfg(feature = "redis-store")]
            WindowBackend::Redis => {
                let url = config.redis_url.clone().ok_or_else(|| {
                    WindowStoreError::Backend("redis backend requires redis_url".to_string())
                })?;
                let store = RedisWindowStore::connect(&url).await?;
                Ok(Self::new(config, Arc::new(store), Arc::new(SystemClock)))
            }
            #[cfg(not(feature = "redis-store"))]
            WindowBackend::Redis => Err(WindowStoreError::Backend(
                "built without the redis-store feature".to_string(),
            )),
        }
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.inner.config
    }

    /// Check every tier and, on success, record the request in all windows.
    ///
    /// # Errors
    ///
    /// [`EngineError::RateLimited`] naming the first tier that refused.
    pub async fn admit(&self, actor: &Actor) -> EngineResult<()> {
        if let Some(global) = &self.inner.global {
            if let Err(not_until) = global.check() {
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                tracing::warn!(
                    actor_id = %actor.id,
                    retry_after = ?retry_after,
                    "Global rate limit exceeded"
                );
                return Err(EngineError::RateLimited {
                    tier: RateLimitTier::Global,
                    retry_after,
                });
            }
        }

        let checks = self.inner.checks(actor);
        let now = self.inner.clock.now();
        match self.inner.store.try_acquire(&checks, now).await {
            Ok(WindowDecision::Admitted) => Ok(()),
            Ok(WindowDecision::Denied { index, retry_after }) => {
                let tier = WINDOW_TIERS
                    .get(index)
                    .copied()
                    .unwrap_or(RateLimitTier::Client);
                tracing::warn!(
                    actor_id = %actor.id,
                    tier = %tier,
                    retry_after = ?retry_after,
                    "Rate limit exceeded"
                );
                Err(EngineError::RateLimited { tier, retry_after })
            }
            Err(e) if self.inner.config.fail_open => {
                tracing::error!(error = %e, actor_id = %actor.id, "Rate limit store unavailable; admitting");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, actor_id = %actor.id, "Rate limit store unavailable; refusing");
                Err(EngineError::RateLimited {
                    tier: RateLimitTier::Global,
                    retry_after: Duration::from_secs(1),
                })
            }
        }
    }

    /// Whether a request would be admitted now. Records nothing.
    pub async fn is_allowed(&self, actor: &Actor) -> bool {
        let checks = self.inner.checks(actor);
        match self.inner.store.peek(&checks, self.inner.clock.now()).await {
            Ok(decision) => decision == WindowDecision::Admitted,
            Err(e) => {
                tracing::error!(error = %e, "Rate limit store unavailable");
                self.inner.config.fail_open
            }
        }
    }

    /// Record a request in every window without checking.
    pub async fn record(&self, actor: &Actor) {
        let checks = self.inner.checks(actor);
        if let Err(e) = self.inner.store.record(&checks, self.inner.clock.now()).await {
            tracing::error!(error = %e, actor_id = %actor.id, "Failed to record rate limit entry");
        }
    }

    /// Purge entries older than the largest window. Returns entries removed.
    pub async fn sweep(&self) -> usize {
        match self.inner.sweep().await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired rate limit entries");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "Rate limit sweep failed");
                0
            }
        }
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval_secs` until the
    /// limiter is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let period = Duration::from_secs(self.inner.config.sweep_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    tracing::debug!("Rate limiter dropped; stopping sweeper");
                    break;
                };
                match inner.sweep().await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "Swept expired rate limit entries");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Rate limit sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RequestOrigin;

    fn config(burst: u32, standard: u32, client: u32) -> RateLimitConfig {
        RateLimitConfig {
            burst: WindowConfig {
                window_secs: 60,
                max_requests: burst,
            },
            standard: WindowConfig {
                window_secs: 300,
                max_requests: standard,
            },
            client: WindowConfig {
                window_secs: 900,
                max_requests: client,
            },
            ..RateLimitConfig::default()
        }
    }

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_700_000_000)));
        (RateLimiter::with_clock(config, clock.clone()), clock)
    }

    fn actor(id: &str, ip: &str) -> Actor {
        Actor::new(id).with_origin(RequestOrigin {
            remote_addr: ip.parse().ok(),
            ..RequestOrigin::default()
        })
    }

    #[tokio::test]
    async fn test_burst_boundary() {
        let (limiter, clock) = limiter(config(5, 10, 100));
        let alice = actor("alice", "10.0.0.1");

        for _ in 0..5 {
            limiter.admit(&alice).await.unwrap();
        }
        let err = limiter.admit(&alice).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimited {
                tier: RateLimitTier::Burst,
                ..
            }
        ));

        clock.advance(Duration::from_secs(60));
        limiter.admit(&alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_standard_tier_trips_after_burst_windows_roll() {
        let (limiter, clock) = limiter(config(5, 6, 100));
        let alice = actor("alice", "10.0.0.1");

        for _ in 0..5 {
            limiter.admit(&alice).await.unwrap();
        }
        clock.advance(Duration::from_secs(61));
        limiter.admit(&alice).await.unwrap();
        let err = limiter.admit(&alice).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimited {
                tier: RateLimitTier::Standard,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_client_tier_shared_across_actors_from_same_origin() {
        let (limiter, _clock) = limiter(config(5, 10, 3));
        let origin = RequestOrigin {
            remote_addr: "10.0.0.9".parse().ok(),
            user_agent: Some("bot".to_string()),
            ..RequestOrigin::default()
        };
        let anon = |id: &str| Actor::new(id).unauthenticated().with_origin(origin.clone());

        limiter.admit(&anon("a")).await.unwrap();
        limiter.admit(&anon("b")).await.unwrap();
        limiter.admit(&anon("c")).await.unwrap();
        let err = limiter.admit(&anon("d")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimited {
                tier: RateLimitTier::Client,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let (limiter, _clock) = limiter(config(1, 10, 100));
        limiter.admit(&actor("alice", "10.0.0.1")).await.unwrap();
        limiter.admit(&actor("bob", "10.0.0.2")).await.unwrap();
        assert!(!limiter.is_allowed(&actor("alice", "10.0.0.1")).await);
        assert!(limiter.is_allowed(&actor("carol", "10.0.0.3")).await);
    }

    #[tokio::test]
    async fn test_record_consumes_room() {
        let (limiter, _clock) = limiter(config(2, 10, 100));
        let alice = actor("alice", "10.0.0.1");
        limiter.record(&alice).await;
        limiter.record(&alice).await;
        assert!(!limiter.is_allowed(&alice).await);
    }

    #[tokio::test]
    async fn test_sweep_purges_past_largest_window() {
        let (limiter, clock) = limiter(config(5, 10, 100));
        limiter.admit(&actor("alice", "10.0.0.1")).await.unwrap();
        assert_eq!(limiter.sweep().await, 0);

        clock.advance(Duration::from_secs(901));
        assert_eq!(limiter.sweep().await, 3);
    }

    #[tokio::test]
    async fn test_global_quota_checked_first() {
        let mut config = config(100, 100, 100);
        config.global_per_second = Some(1);
        let (limiter, _clock) = limiter(config);

        limiter.admit(&actor("alice", "10.0.0.1")).await.unwrap();
        let err = limiter.admit(&actor("bob", "10.0.0.2")).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::RateLimited {
                tier: RateLimitTier::Global,
                ..
            }
        ));
    }

    #[test]
    fn test_tier_labels() {
        assert_eq!(RateLimitTier::Burst.to_string(), "burst");
        assert_eq!(
            serde_json::to_string(&RateLimitTier::Client).unwrap(),
            "\"client\""
        );
    }
}
