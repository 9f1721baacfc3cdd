//! Concurrent writers and retry behaviour against the in-memory store.

mod common;

use std::sync::Arc;

use approval_engine::domain::{Actor, EntityKey};
use approval_engine::store::StoreErrorKind;
use approval_engine::{EngineContext, ErrorKind};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approvals_advance_once() {
    common::init_logging();
    let context = Arc::new(
        EngineContext::in_memory(common::config(), common::catalog())
            .await
            .unwrap(),
    );
    let key = EntityKey::new("purchase_order", "race");
    context
        .engine()
        .create_workflow(&key, "alice", "purchase_order")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = context.engine().clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let actor = Actor::new(format!("manager-{i}")).with_role("manager");
            engine.approve(&key, &actor, 0, "race").await
        }));
    }

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(outcome) => {
                successes += 1;
                assert_eq!(outcome.current_state, "step_0_approved");
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::Validation, "unexpected error: {e}"),
        }
    }
    assert_eq!(successes, 1);

    let instance = context.engine().get_instance(&key).await.unwrap();
    assert_eq!(instance.current_state, "step_0_approved");
    assert_eq!(instance.approval_history.len(), 1);
    assert_eq!(instance.version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_votes_on_multi_approval_step() {
    let context = Arc::new(
        EngineContext::in_memory(common::config(), common::catalog())
            .await
            .unwrap(),
    );
    let engine = context.engine();
    let key = EntityKey::new("purchase_order", "finance-race");
    engine.create_workflow(&key, "alice", "purchase_order").await.unwrap();
    engine
        .approve(&key, &Actor::new("bob").with_role("manager"), 0, "")
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..6 {
        let engine = engine.clone();
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            let actor = Actor::new(format!("finance-{i}")).with_role("finance");
            engine.approve(&key, &actor, 1, "").await
        }));
    }
    let results: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    // Step 1 needs two approvals; the rest find the workflow finished.
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 2);
    let instance = engine.get_instance(&key).await.unwrap();
    assert_eq!(instance.current_state, "approved");
    assert_eq!(instance.approval_history.len(), 3);
    assert_eq!(instance.version, 4);
}

#[tokio::test]
async fn test_injected_deadlocks_are_retried() {
    let context = EngineContext::in_memory(common::config(), common::catalog())
        .await
        .unwrap();
    let engine = context.engine();
    let key = EntityKey::new("purchase_order", "deadlock");
    engine.create_workflow(&key, "alice", "purchase_order").await.unwrap();

    let before = engine.coordinator().stats();
    context.pool().factory().fail_next(3, StoreErrorKind::Deadlock);
    let outcome = engine
        .approve(&key, &Actor::new("bob").with_role("manager"), 0, "")
        .await
        .unwrap();
    let after = engine.coordinator().stats();

    assert!(outcome.success);
    assert_eq!(after.attempts - before.attempts, 4);
    assert_eq!(after.retries - before.retries, 3);
    assert_eq!(engine.get_instance(&key).await.unwrap().approval_history.len(), 1);
}

#[tokio::test]
async fn test_persistent_deadlock_surfaces_after_budget() {
    let mut config = common::config();
    config.transaction.deadlock_retry_attempts = 2;
    let context = EngineContext::in_memory(config, common::catalog()).await.unwrap();
    let engine = context.engine();
    let key = EntityKey::new("purchase_order", "stuck");
    engine.create_workflow(&key, "alice", "purchase_order").await.unwrap();

    context.pool().factory().fail_next(100, StoreErrorKind::Deadlock);
    let err = engine
        .approve(&key, &Actor::new("bob").with_role("manager"), 0, "")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Deadlock);

    context.pool().factory().fail_next(0, StoreErrorKind::Deadlock);
    let instance = engine.get_instance(&key).await.unwrap();
    assert!(instance.approval_history.is_empty());
    assert_eq!(instance.version, 1);
}
