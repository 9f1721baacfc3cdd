//! Pool behaviour when every connection is checked out.

use std::time::Duration;

use approval_engine::config::{PoolConfig, ScalingConfig};
use approval_engine::pool::{ConnectionPoolManager, HealthStatus};
use approval_engine::store::MemoryStore;
use approval_engine::{EngineError, ErrorKind};

fn pool(pool_size: usize, max_overflow: usize) -> ConnectionPoolManager<MemoryStore> {
    let config = PoolConfig {
        pool_size,
        max_overflow,
        pool_timeout_secs: 1,
        ..PoolConfig::default()
    };
    ConnectionPoolManager::new(MemoryStore::default(), config, ScalingConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_overflow_then_exhaustion() {
    let pool = pool(2, 1);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let conn = pool.acquire().await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
            Ok::<_, EngineError>(())
        }));
    }

    let mut ok = 0;
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => ok += 1,
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::ConnectionPoolExhaustion);
                exhausted += 1;
            }
        }
    }
    assert!(exhausted >= 1);
    assert!(ok <= 3);
    assert!(pool.metrics().timeouts >= 1);
    assert!(pool.metrics().peak_concurrent <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_release_wakes_waiter() {
    let pool = pool(1, 0);
    let held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await.map(drop) })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    drop(held);

    tokio_test::assert_ok!(waiter.await.unwrap());
    assert_eq!(pool.metrics().checked_out, 0);
}

#[tokio::test]
async fn test_health_degrades_when_ping_fails() {
    let pool = pool(2, 0);
    assert_eq!(pool.health_check().await.status, HealthStatus::Healthy);

    pool.factory().fail_next_pings(1);
    let report = pool.health_check().await;
    assert_ne!(report.status, HealthStatus::Healthy);
    assert!(!report.issues.is_empty());
}
