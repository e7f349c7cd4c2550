//! Connection Pool Integration Tests
//!
//! Drives the pool end to end through the JSON-lines binding against an
//! in-process gateway: acquire, lease, dispatch, eviction and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_pool::{
    AllocationStore, DispatchError, EvictionReason, FileAllocationStore, MemoryAllocationStore,
    PaceBudget, PacingConfig, PoolError, Purpose, RequestCategory,
};
use serde_json::json;
use support::{Behavior, FakeGateway, eventually, pool_config, start_pool};

fn memory_store() -> Arc<dyn AllocationStore> {
    Arc::new(MemoryAllocationStore::new())
}

#[tokio::test]
async fn test_lease_dispatches_over_its_own_session() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let lease = pool.acquire_default(Purpose::Interactive).await.unwrap();
    let response = lease
        .send(RequestCategory::General, json!({"q": 1}))
        .await
        .unwrap();

    assert_eq!(response["session_id"], lease.session_id().get());
    assert_eq!(response["echo"], json!({"q": 1}));
    assert_eq!(gateway.hellos(), vec![lease.session_id()]);
    assert_eq!(gateway.requests(), 1);
}

#[tokio::test]
async fn test_third_concurrent_acquire_times_out_at_capacity_two() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(&gateway, pool_config(2), PacingConfig::default(), memory_store());

    let timeout = Duration::from_secs(1);
    let (a, b, c) = tokio::join!(
        pool.acquire(Purpose::Backfill, timeout),
        pool.acquire(Purpose::Backfill, timeout),
        pool.acquire(Purpose::Backfill, timeout),
    );
    let (ok, err): (Vec<_>, Vec<_>) = [a, b, c].into_iter().partition(Result::is_ok);
    let leases: Vec<_> = ok.into_iter().map(Result::unwrap).collect();
    let failures: Vec<_> = err.into_iter().map(Result::unwrap_err).collect();

    assert_eq!(leases.len(), 2);
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        failures[0],
        PoolError::AcquireTimeout {
            purpose: Purpose::Backfill,
            ..
        }
    ));
    assert_eq!(gateway.hellos().len(), 2);

    drop(leases);
    let again = pool
        .acquire(Purpose::Backfill, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(gateway.hellos().contains(&again.session_id()));
    assert_eq!(gateway.hellos().len(), 2, "idle connection reused");
}

#[tokio::test]
async fn test_waiting_acquire_takes_connection_released_within_timeout() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(&gateway, pool_config(2), PacingConfig::default(), memory_store());

    let first = pool
        .acquire(Purpose::Backfill, Duration::from_secs(5))
        .await
        .unwrap();
    let second = pool
        .acquire(Purpose::Backfill, Duration::from_secs(5))
        .await
        .unwrap();
    let released = second.connection_id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let started = Instant::now();
            let lease = pool.acquire(Purpose::Backfill, Duration::from_secs(3)).await;
            (lease, started.elapsed())
        }
    });
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!waiter.is_finished(), "acquire waits while at capacity");
    drop(second);

    let (lease, waited) = waiter.await.unwrap();
    let lease = lease.unwrap();
    assert_eq!(lease.connection_id(), released);
    assert!(waited >= Duration::from_millis(400), "{waited:?}");
    assert!(waited < Duration::from_secs(3), "{waited:?}");
    assert_eq!(gateway.hellos().len(), 2, "no third session opened");
    drop(first);
}

#[tokio::test]
async fn test_handshake_that_never_syncs_times_out_without_requests() {
    let gateway = FakeGateway::start(Behavior::NeverSynced).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let err = pool
        .acquire(Purpose::Interactive, Duration::from_millis(500))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::AcquireTimeout { .. }), "{err}");
    assert_eq!(gateway.requests(), 0);
    assert!(eventually(|| pool.stats().total_connections() == 0).await);
    assert!(eventually(|| pool.registry().allocated().is_empty()).await);
}

#[tokio::test]
async fn test_rejected_session_surfaces_fatal_error() {
    let gateway = FakeGateway::start(Behavior::Reject(200)).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let err = pool
        .acquire(Purpose::Interactive, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::Fatal { code: 200, .. }), "{err}");
    assert_eq!(gateway.hellos().len(), 1, "fatal rejections are not retried");
    assert!(eventually(|| pool.registry().allocated().is_empty()).await);
}

#[tokio::test]
async fn test_gateway_hang_up_evicts_and_replacement_uses_fresh_id() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let lease = pool
        .acquire(Purpose::Streaming, Duration::from_secs(5))
        .await
        .unwrap();
    let first = lease.session_id();
    drop(lease);

    gateway.hang_up(first);
    assert!(eventually(|| pool.stats().total_connections() == 0).await);
    assert!(!pool.registry().is_allocated(first));

    let replacement = pool
        .acquire(Purpose::Streaming, Duration::from_secs(5))
        .await
        .unwrap();
    assert_ne!(replacement.session_id(), first);
    assert_eq!(gateway.hellos(), vec![first, replacement.session_id()]);
}

#[tokio::test]
async fn test_fatal_dispatch_error_evicts_connection() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let lease = pool
        .acquire(Purpose::Interactive, Duration::from_secs(5))
        .await
        .unwrap();
    let connection_id = lease.connection_id();
    let err = lease
        .send(
            RequestCategory::ContractDetails,
            json!({"fail_code": 200, "message": "No security definition has been found"}),
        )
        .await
        .unwrap_err();
    drop(lease);

    assert!(
        matches!(err, DispatchError::FatalProtocol { code: 200, .. }),
        "{err}"
    );
    assert_eq!(gateway.requests(), 1, "fatal errors are not retried");
    assert!(eventually(|| pool.stats().total_connections() == 0).await);
    let stats = pool.stats();
    assert!(
        stats
            .recent_evictions
            .iter()
            .any(|e| e.connection_id == connection_id && e.reason == EvictionReason::Fatal)
    );
}

#[tokio::test]
async fn test_pacing_violation_cools_down_only_its_category() {
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let mut pacing = PacingConfig::default();
    pacing.budgets.insert(
        RequestCategory::Historical,
        PaceBudget::new(10, Duration::from_secs(1), Duration::from_secs(5)),
    );
    pacing.retry.initial_delay = Duration::from_millis(10);
    pacing.retry.jitter_factor = 0.0;
    let (pool, _) = start_pool(&gateway, pool_config(1), pacing, memory_store());

    let lease = pool
        .acquire(Purpose::Backfill, Duration::from_secs(5))
        .await
        .unwrap();
    let err = lease
        .send(
            RequestCategory::Historical,
            json!({"fail_code": 162, "message": "pacing violation"}),
        )
        .await
        .unwrap_err();

    match err {
        DispatchError::PacingViolation {
            category,
            retry_after,
        } => {
            assert_eq!(category, RequestCategory::Historical);
            assert!(retry_after > Duration::from_secs(3));
        }
        other => panic!("expected pacing violation, got {other}"),
    }
    assert_eq!(gateway.requests(), 1, "nothing sent during cooldown");

    let ok = lease
        .send(RequestCategory::MarketData, json!({"snapshot": "AAPL"}))
        .await
        .unwrap();
    assert_eq!(ok["echo"]["snapshot"], "AAPL");
    assert!(pool.pace().cooldown_remaining(RequestCategory::Historical).is_some());
    assert!(pool.pace().cooldown_remaining(RequestCategory::MarketData).is_none());
}

#[tokio::test]
async fn test_shutdown_reports_outstanding_leases_and_persists_empty_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.json");
    let gateway = FakeGateway::start(Behavior::Ready).await;
    let (pool, _) = start_pool(
        &gateway,
        pool_config(2),
        PacingConfig::default(),
        Arc::new(FileAllocationStore::new(&path)),
    );

    let held = pool
        .acquire(Purpose::Interactive, Duration::from_secs(5))
        .await
        .unwrap();
    let returned = pool
        .acquire(Purpose::Interactive, Duration::from_secs(5))
        .await
        .unwrap();
    drop(returned);
    assert_eq!(
        FileAllocationStore::new(&path).load().unwrap().len(),
        2,
        "allocations persisted while live"
    );

    let report = pool.shutdown(Duration::from_millis(200)).await;
    assert_eq!(report.outstanding_leases, 1);
    assert_eq!(report.connections_closed, 2);

    assert!(matches!(
        pool.acquire(Purpose::Interactive, Duration::from_secs(1)).await,
        Err(PoolError::ShuttingDown)
    ));
    assert!(held.send(RequestCategory::General, json!({})).await.is_err());
    drop(held);

    assert!(FileAllocationStore::new(&path).load().unwrap().is_empty());
}

#[tokio::test]
async fn test_stalled_handshake_is_retried_with_a_fresh_id() {
    let gateway = FakeGateway::start(Behavior::NeverSynced).await;
    let (pool, _) = start_pool(&gateway, pool_config(1), PacingConfig::default(), memory_store());

    let acquire = tokio::spawn({
        let pool = pool.clone();
        async move {
            pool.acquire(Purpose::Interactive, Duration::from_secs(10))
                .await
        }
    });
    assert!(eventually(|| !gateway.hellos().is_empty()).await);
    gateway.set_behavior(Behavior::Ready);

    let lease = acquire.await.unwrap().unwrap();
    let hellos = gateway.hellos();
    assert_eq!(hellos.len(), 2);
    assert_ne!(hellos[0], hellos[1]);
    assert_eq!(lease.session_id(), hellos[1]);
    assert_eq!(gateway.requests(), 0);
    assert!(!pool.registry().is_allocated(hellos[0]));
}
