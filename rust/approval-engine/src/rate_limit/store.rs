//! Sliding-window counter stores.
//!
//! A window holds one timestamp per admitted request. An entry recorded at
//! `t` counts while `now - t < window`.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Errors from a window store backend.
#[derive(Debug, thiserror::Error)]
pub enum WindowStoreError {
    /// Redis command failed.
    #[cfg(feature = "redis-store")]
    #[error("redis window store: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure.
    #[error("window store: {0}")]
    Backend(String),
}

/// One window to check for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCheck {
    /// Counter key.
    pub key: String,
    /// Window length.
    pub window: Duration,
    /// Requests allowed per window.
    pub limit: u32,
}

/// Result of checking a set of windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowDecision {
    /// Every window had room.
    Admitted,
    /// The window at `index` is full.
    Denied {
        /// Index into the checks slice.
        index: usize,
        /// Time until the oldest entry leaves that window.
        retry_after: Duration,
    },
}

/// Backend holding sliding-window timestamps.
#[async_trait]
pub trait WindowStore: Send + Sync + Debug {
    /// Check every window without recording.
    async fn peek(
        &self,
        checks: &[WindowCheck],
        now: Duration,
    ) -> Result<WindowDecision, WindowStoreError>;

    /// Check every window and, if all have room, record `now` in each.
    async fn try_acquire(
        &self,
        checks: &[WindowCheck],
        now: Duration,
    ) -> Result<WindowDecision, WindowStoreError>;

    /// Record `now` in every window unconditionally.
    async fn record(&self, checks: &[WindowCheck], now: Duration) -> Result<(), WindowStoreError>;

    /// Drop entries recorded at or before `cutoff`. With
    /// `cutoff = now - window` these are exactly the entries that no longer
    /// count. Returns entries removed.
    async fn purge_before(&self, cutoff: Duration) -> Result<usize, WindowStoreError>;
}

/// Process-local window store.
#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: Mutex<HashMap<String, VecDeque<Duration>>>,
}

impl InMemoryWindowStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    fn evaluate(
        windows: &mut HashMap<String, VecDeque<Duration>>,
        checks: &[WindowCheck],
        now: Duration,
    ) -> WindowDecision {
        for (index, check) in checks.iter().enumerate() {
            let Some(entries) = windows.get_mut(&check.key) else {
                if check.limit == 0 {
                    return WindowDecision::Denied {
                        index,
                        retry_after: check.window,
                    };
                }
                continue;
            };

            while entries
                .front()
                .is_some_and(|t| now.saturating_sub(*t) >= check.window)
            {
                entries.pop_front();
            }

            if entries.len() >= check.limit as usize {
                let oldest = entries.front().copied().unwrap_or(now);
                let retry_after = (oldest + check.window).saturating_sub(now);
                return WindowDecision::Denied { index, retry_after };
            }
        }
        WindowDecision::Admitted
    }

    fn push_all(
        windows: &mut HashMap<String, VecDeque<Duration>>,
        checks: &[WindowCheck],
        now: Duration,
    ) {
        for check in checks {
            windows.entry(check.key.clone()).or_default().push_back(now);
        }
    }
}

#[async_trait]
impl WindowStore for InMemoryWindowStore {
    async fn peek(
        &self,
        checks: &[WindowCheck],
        now: Duration,
    ) -> Result<WindowDecision, WindowStoreError> {
        let mut windows = self.windows.lock();
        Ok(Self::evaluate(&mut windows, checks, now))
    }

    async fn try_acquire(
        &self,
        checks: &[WindowCheck],
        now: Duration,
    ) -> Result<WindowDecision, WindowStoreError> {
        let mut windows = self.windows.lock();
        let decision = Self::evaluate(&mut windows, checks, now);
        if decision == WindowDecision::Admitted {
            Self::push_all(&mut windows, checks, now);
        }
        Ok(decision)
    }

    async fn record(&self, checks: &[WindowCheck], now: Duration) -> Result<(), WindowStoreError> {
        let mut windows = self.windows.lock();
        Self::push_all(&mut windows, checks, now);
        Ok(())
    }

    async fn purge_before(&self, cutoff: Duration) -> Result<usize, WindowStoreError> {
        let mut windows = self.windows.lock();
        let mut removed = 0;
        windows.retain(|_, entries| {
            while entries.front().is_some_and(|t| *t <= cutoff) {
                entries.pop_front();
                removed += 1;
            }
            !entries.is_empty()
        });
        Ok(removed)
    }
}

#[cfg(feature = "redis-store")]
pub use redis_store::RedisWindowStore;

#[cfg(feature = "redis-store")]
mod redis_store {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::Script;

    use super::{WindowCheck, WindowDecision, WindowStore, WindowStoreError};

    fn millis(d: Duration) -> u64 {
        u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
    }

    /// Checks every window and, when all have room and `ARGV[1]` is `1`,
    /// records the request in each. Runs server side, so concurrent
    /// processes never admit past a limit.
    ///
    /// `KEYS` are the window keys; `ARGV` is `record, now_ms, member`
    /// followed by `window_ms, limit` per key. Replies `{0}` when admitted
    /// and `{1, index, retry_after_ms}` when a window is full.
    const ACQUIRE_SCRIPT: &str = r"
local record = ARGV[1] == '1'
local now = tonumber(ARGV[2])
local member = ARGV[3]
for i, key in ipairs(KEYS) do
  local window = tonumber(ARGV[2 + i * 2])
  local limit = tonumber(ARGV[3 + i * 2])
  redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
  if redis.call('ZCARD', key) >= limit then
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    local retry = window
    if #oldest == 2 then
      retry = tonumber(oldest[2]) + window - now
    end
    return {1, i - 1, math.max(retry, 0)}
  end
end
if record then
  for i, key in ipairs(KEYS) do
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, tonumber(ARGV[2 + i * 2]))
  end
end
return {0}
";

    fn decode_reply(reply: &[i64]) -> Result<WindowDecision, WindowStoreError> {
        match *reply {
            [0] => Ok(WindowDecision::Admitted),
            [1, index, retry_ms] => Ok(WindowDecision::Denied {
                index: usize::try_from(index)
                    .map_err(|_| WindowStoreError::Backend(format!("bad window index {index}")))?,
                retry_after: Duration::from_millis(u64::try_from(retry_ms).unwrap_or(0)),
            }),
            _ => Err(WindowStoreError::Backend(format!(
                "unexpected acquire reply {reply:?}"
            ))),
        }
    }

    /// Sliding windows in Redis sorted sets, shared across processes.
    ///
    /// Each key is a sorted set of request timestamps (milliseconds) that
    /// expires one window after its last write. Check and record run in
    /// one Lua script.
    #[derive(Clone)]
    pub struct RedisWindowStore {
        conn: ConnectionManager,
        prefix: String,
        script: Arc<Script>,
    }

    impl std::fmt::Debug for RedisWindowStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RedisWindowStore")
                .field("prefix", &self.prefix)
                .finish_non_exhaustive()
        }
    }

    impl RedisWindowStore {
        /// Connect to `url`.
        pub async fn connect(url: &str) -> Result<Self, WindowStoreError> {
            let client = redis::Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            tracing::info!("Connected rate limit window store to Redis");
            Ok(Self {
                conn,
                prefix: "approval:rate_limit:".to_string(),
                script: Arc::new(Script::new(ACQUIRE_SCRIPT)),
            })
        }

        fn key(&self, key: &str) -> String {
            format!("{}{key}", self.prefix)
        }

        async fn run(
            &self,
            checks: &[WindowCheck],
            now: Duration,
            record: bool,
        ) -> Result<WindowDecision, WindowStoreError> {
            if checks.is_empty() {
                return Ok(WindowDecision::Admitted);
            }
            let mut conn = self.conn.clone();
            let now_ms = millis(now);

            let mut invocation = self.script.prepare_invoke();
            for check in checks {
                invocation.key(self.key(&check.key));
            }
            invocation
                .arg(u8::from(record))
                .arg(now_ms)
                .arg(format!("{now_ms}-{}", uuid::Uuid::new_v4()));
            for check in checks {
                invocation.arg(millis(check.window)).arg(check.limit);
            }
            let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
            decode_reply(&reply)
        }
    }

    #[async_trait]
    impl WindowStore for RedisWindowStore {
        async fn peek(
            &self,
            checks: &[WindowCheck],
            now: Duration,
        ) -> Result<WindowDecision, WindowStoreError> {
            self.run(checks, now, false).await
        }

        async fn try_acquire(
            &self,
            checks: &[WindowCheck],
            now: Duration,
        ) -> Result<WindowDecision, WindowStoreError> {
            self.run(checks, now, true).await
        }

        async fn record(
            &self,
            checks: &[WindowCheck],
            now: Duration,
        ) -> Result<(), WindowStoreError> {
            let mut conn = self.conn.clone();
            let now_ms = millis(now);
            let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

            let mut pipe = redis::pipe();
            pipe.atomic();
            for check in checks {
                let key = self.key(&check.key);
                pipe.cmd("ZADD").arg(&key).arg(now_ms).arg(&member).ignore();
                pipe.cmd("PEXPIRE")
                    .arg(&key)
                    .arg(millis(check.window))
                    .ignore();
            }
            let () = pipe.query_async(&mut conn).await?;
            Ok(())
        }

        async fn purge_before(&self, _cutoff: Duration) -> Result<usize, WindowStoreError> {
            // Keys expire on their own and stale members are trimmed on read.
            Ok(0)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_decode_admitted_and_denied() {
            assert_eq!(decode_reply(&[0]).unwrap(), WindowDecision::Admitted);
            assert_eq!(
                decode_reply(&[1, 2, 1500]).unwrap(),
                WindowDecision::Denied {
                    index: 2,
                    retry_after: Duration::from_millis(1500),
                }
            );
        }

        #[test]
        fn test_decode_rejects_malformed_reply() {
            assert!(decode_reply(&[]).is_err());
            assert!(decode_reply(&[1, 0]).is_err());
            assert!(decode_reply(&[1, -1, 10]).is_err());
        }

        #[test]
        fn test_script_checks_every_window_before_recording() {
            let first_add = ACQUIRE_SCRIPT.find("ZADD").unwrap();
            let last_card = ACQUIRE_SCRIPT.rfind("ZCARD").unwrap();
            assert!(last_card < first_add);
            assert!(ACQUIRE_SCRIPT.contains("if record then"));
        }
    }
}
