//! Registry tests against a live etcd v3 cluster.
//!
//! Endpoints come from `ETCD_ENDPOINTS` (comma separated, default
//! `127.0.0.1:2379`). Every test works under its own key prefix.
//!
//! # Running
//!
//! The tests are marked `#[ignore]` so normal runs never need a cluster:
//! ```bash
//! cargo test --features etcd --test etcd -- --ignored --test-threads=1
//! ```

#![cfg(feature = "etcd")]

mod common;

use common::{attrs, ctx, subnet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use subnet_lease::store::{EtcdStore, KvBackend, WatchRange};
use subnet_lease::{Config, Event, LeaseRegistry, Registry};

fn endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .unwrap_or_else(|_| "127.0.0.1:2379".to_string())
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

fn config(name: &str) -> Config {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let mut config = Config::default();
    config.store.endpoints = endpoints();
    config.registry.prefix = format!("/subnet-lease-test/{name}-{nanos}");
    config
}

async fn registry(name: &str) -> LeaseRegistry<EtcdStore> {
    LeaseRegistry::connect(&config(name)).await.unwrap()
}

// ============================================================================
// Leases
// ============================================================================

#[tokio::test]
#[ignore]
async fn create_get_and_delete_subnet() {
    let registry = registry("crud").await;
    let sn = subnet("10.5.1.0/24");

    let ttl = registry
        .create_subnet(&ctx(), sn, &attrs("192.168.2.1"), 60)
        .await
        .unwrap();
    assert_eq!(ttl, 60);

    let (lease, revision) = registry.get_subnet(&ctx(), sn).await.unwrap();
    assert_eq!(lease.subnet, sn);
    assert_eq!(lease.attrs, Some(attrs("192.168.2.1")));
    assert!(lease.expiration.is_some());
    assert!(revision > 0);

    let (leases, _) = registry.get_subnets(&ctx()).await.unwrap();
    assert_eq!(leases.len(), 1);

    registry.delete_subnet(&ctx(), sn).await.unwrap();
    assert!(registry.get_subnet(&ctx(), sn).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore]
async fn revoked_lease_reports_not_found() {
    let registry = registry("revoke").await;
    let store = registry.backend();

    let lease = store.grant(30).await.unwrap();
    assert!(store.time_to_live(lease).await.unwrap() > 0);
    store.revoke(lease).await.unwrap();
    assert!(store.time_to_live(lease).await.is_err());
}

// ============================================================================
// Watches
// ============================================================================

#[tokio::test]
#[ignore]
async fn watch_resumes_after_revision() {
    let registry = registry("watch").await;
    let (_, since) = registry.get_subnets(&ctx()).await.unwrap();
    let sn = subnet("10.5.2.0/24");

    registry
        .create_subnet(&ctx(), sn, &attrs("192.168.2.2"), 60)
        .await
        .unwrap();

    let (event, revision) = tokio::time::timeout(
        Duration::from_secs(5),
        registry.watch_subnet(&ctx(), since, sn),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(revision > since);
    match event {
        Event::Added(lease) => assert_eq!(lease.subnet, sn),
        other => panic!("expected Added, got {other:?}"),
    }
}

#[tokio::test]
#[ignore]
async fn raw_watch_groups_events_by_revision() {
    use futures::StreamExt;

    let registry = registry("raw-watch").await;
    let store = registry.backend();
    let prefix = format!("{}/raw/", registry.layout().prefix());
    let first = store
        .put(format!("{prefix}a").as_bytes(), b"1".to_vec(), None)
        .await
        .unwrap();
    store
        .put(format!("{prefix}b").as_bytes(), b"2".to_vec(), None)
        .await
        .unwrap();

    let mut stream = store
        .watch(WatchRange::prefix(prefix.into_bytes()), first)
        .await
        .unwrap();
    let batch = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(batch.revision, first);
    assert_eq!(batch.events.len(), 1);
}

// ============================================================================
// Mutual exclusion
// ============================================================================

#[tokio::test]
#[ignore]
async fn guarded_section_runs_and_releases() {
    let registry = registry("guard").await;

    let value = registry
        .guard()
        .with_lock(&ctx(), || async { Ok(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);

    // A second section acquires the released mutex promptly.
    let again = tokio::time::timeout(
        Duration::from_secs(5),
        registry.guard().with_lock(&ctx(), || async { Ok(8) }),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(again, 8);
}
