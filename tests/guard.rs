//! Mutual exclusion guard tests.

mod common;

use common::{ctx, harness, START_MS};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subnet_lease::core::time::{ManualClock, Tick};
use subnet_lease::registry::LOCK_PATH;
use subnet_lease::store::Faults;
use subnet_lease::{
    CancelReason, Context, LockStage, MemoryStore, MutualExclusionGuard, RegistryError,
};

fn guard(store: &MemoryStore, session_ttl: i64) -> Arc<MutualExclusionGuard<MemoryStore>> {
    Arc::new(MutualExclusionGuard::new(Arc::new(store.clone()), session_ttl))
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn section_result_is_returned_and_lock_released() {
    let h = harness();
    let held_during = Arc::new(AtomicBool::new(false));

    let value = {
        let store = h.store.clone();
        let held_during = Arc::clone(&held_during);
        h.registry
            .guard()
            .with_lock(&ctx(), || async move {
                held_during.store(store.lock_holder(LOCK_PATH.as_bytes()).is_some(), Ordering::SeqCst);
                Ok(42)
            })
            .await
            .unwrap()
    };

    assert_eq!(value, 42);
    assert!(held_during.load(Ordering::SeqCst));
    assert_eq!(h.store.lock_holder(LOCK_PATH.as_bytes()), None);
    assert_eq!(h.store.lease_count(), 0);
}

#[tokio::test]
async fn section_failure_is_propagated_as_critical_section() {
    let h = harness();
    let err = h
        .registry
        .guard()
        .with_lock(&ctx(), || async {
            Err::<(), _>(RegistryError::not_found("/coreos.com/network/config"))
        })
        .await
        .unwrap_err();

    assert_eq!(err.lock_acquired(), Some(true));
    match err {
        RegistryError::CriticalSection { source } => assert!(source.is_not_found()),
        other => panic!("expected critical section failure, got {other:?}"),
    }
    assert_eq!(h.store.lock_holder(LOCK_PATH.as_bytes()), None);
    assert_eq!(h.store.lease_count(), 0);
}

#[tokio::test]
async fn session_failure_never_runs_section() {
    let h = harness();
    h.store.inject(Faults::SESSION);
    let ran = Arc::new(AtomicBool::new(false));

    let err = {
        let ran = Arc::clone(&ran);
        h.registry
            .guard()
            .with_lock(&ctx(), || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err()
    };

    assert!(matches!(
        err,
        RegistryError::LockFailure {
            stage: LockStage::Session,
            ..
        }
    ));
    assert_eq!(err.lock_acquired(), Some(false));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn acquire_failure_closes_session() {
    let h = harness();
    h.store.inject(Faults::LOCK);

    let err = h
        .registry
        .guard()
        .with_lock(&ctx(), || async { Ok(()) })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RegistryError::LockFailure {
            stage: LockStage::Acquire,
            ..
        }
    ));
    assert_eq!(err.lock_acquired(), Some(false));
    assert_eq!(h.store.lease_count(), 0);
}

#[tokio::test]
async fn expired_session_is_a_lost_lock() {
    let clock = Arc::new(ManualClock::new(Tick::new(START_MS)));
    let store = MemoryStore::with_clock(clock.clone());
    let guard = guard(&store, 5);

    let err = {
        let store = store.clone();
        let clock = clock.clone();
        guard
            .with_lock(&Context::background(), || async move {
                clock.advance(Duration::from_secs(10));
                store.expire_due();
                Ok(())
            })
            .await
            .unwrap_err()
    };

    assert!(matches!(
        err,
        RegistryError::LockFailure {
            stage: LockStage::Release,
            ..
        }
    ));
    assert_eq!(err.lock_acquired(), Some(true));
    assert!(!err.is_retriable());
}

// ============================================================================
// Exclusion
// ============================================================================

#[tokio::test]
async fn concurrent_sections_never_overlap() {
    let store = MemoryStore::new();
    let guard = guard(&store, 60);
    let inside = Arc::new(AtomicUsize::new(0));
    let max_inside = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let guard = Arc::clone(&guard);
        let inside = Arc::clone(&inside);
        let max_inside = Arc::clone(&max_inside);
        tasks.push(tokio::spawn(async move {
            guard
                .with_lock(&ctx(), || async move {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert_eq!(store.lock_holder(LOCK_PATH.as_bytes()), None);
}

#[tokio::test]
async fn contended_acquire_respects_deadline() {
    let store = MemoryStore::new();
    let guard = guard(&store, 60);
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();
    let (leave_tx, leave_rx) = tokio::sync::oneshot::channel::<()>();

    let holder = {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move {
            guard
                .with_lock(&ctx(), || async move {
                    let _ = entered_tx.send(());
                    let _ = leave_rx.await;
                    Ok(())
                })
                .await
        })
    };
    entered_rx.await.unwrap();

    let short = Context::with_timeout(Duration::from_millis(50));
    let err = guard
        .with_lock(&short, || async { Ok(()) })
        .await
        .unwrap_err();
    match &err {
        RegistryError::LockFailure { stage, reason } => {
            assert_eq!(*stage, LockStage::Acquire);
            assert!(reason.contains(&CancelReason::DeadlineExceeded.to_string()));
        }
        other => panic!("expected acquire failure, got {other:?}"),
    }

    leave_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
    assert_eq!(store.lock_holder(LOCK_PATH.as_bytes()), None);
}

#[tokio::test]
async fn abandoned_section_releases_lock() {
    let store = MemoryStore::new();
    let guard = guard(&store, 60);
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

    let task = {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move {
            guard
                .with_lock(&Context::background(), || async move {
                    let _ = entered_tx.send(());
                    futures::future::pending::<()>().await;
                    Ok(())
                })
                .await
        })
    };
    entered_rx.await.unwrap();
    assert!(store.lock_holder(LOCK_PATH.as_bytes()).is_some());

    task.abort();
    let _ = task.await;

    let mut released = false;
    for _ in 0..50 {
        if store.lock_holder(LOCK_PATH.as_bytes()).is_none() && store.lease_count() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released);
}

// ============================================================================
// Session TTL
// ============================================================================

#[tokio::test]
async fn session_ttl_follows_context_deadline() {
    let store = MemoryStore::new();
    let guard = guard(&store, 60);

    assert_eq!(guard.session_ttl_for(&Context::background()), 60);
    assert_eq!(
        guard.session_ttl_for(&Context::with_timeout(Duration::from_secs(10))),
        10
    );
    assert_eq!(
        guard.session_ttl_for(&Context::with_timeout(Duration::from_millis(200))),
        1
    );
    assert_eq!(
        guard.session_ttl_for(&Context::with_timeout(Duration::from_secs(600))),
        60
    );
}
