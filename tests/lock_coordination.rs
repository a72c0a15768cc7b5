//! Distributed lock scenarios: mutual exclusion, lease expiry, quorum tolerance, and
//! rebuild behaviour under concurrent demand.

#![cfg(feature = "test-utils")]

use futures::future::join_all;
use resilient_cache::connection::{ConnectOptions, StoreConnector};
use resilient_cache::lock::{LockCoordinator, LockPolicy};
use resilient_cache::test_utils::{FakeConnector, FakeStore};
use resilient_cache::{CacheError, CacheRuntime, CacheSettings, Tolerance};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;

const NODES: [&str; 3] = [
    "redis://lock-a:6379",
    "redis://lock-b:6379",
    "redis://lock-c:6379",
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn coordinator(connector: Arc<FakeConnector>, endpoints: &[&str]) -> LockCoordinator {
    init_tracing();
    let connector: Arc<dyn StoreConnector> = connector;
    LockCoordinator::new(
        endpoints.iter().map(|e| e.to_string()).collect(),
        ConnectOptions {
            database: 15,
            connect_retry: 1,
            ..ConnectOptions::default()
        },
        LockPolicy {
            retry_count: 0,
            operation_timeout: Duration::from_millis(200),
            ..LockPolicy::default()
        },
        connector,
    )
}

fn cluster() -> (Vec<FakeStore>, Arc<FakeConnector>) {
    let stores: Vec<FakeStore> = NODES.iter().map(|_| FakeStore::new()).collect();
    let connector = Arc::new(FakeConnector::cluster(
        NODES.iter().copied().zip(stores.iter().cloned()),
    ));
    (stores, connector)
}

#[tokio::test]
async fn test_lock_is_mutually_exclusive() {
    let (_stores, connector) = cluster();
    let coordinator = coordinator(connector, &NODES);

    let first = coordinator
        .try_acquire("invoice:2024-07", Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .expect("first caller acquires");
    assert!(first.is_valid());

    let second = coordinator
        .try_acquire("invoice:2024-07", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(second.is_none());

    assert!(first.release().await.unwrap());
    assert!(coordinator
        .try_acquire("invoice:2024-07", None)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_unreleased_lock_frees_after_lease() {
    let (_stores, connector) = cluster();
    let coordinator = coordinator(connector, &NODES);
    let lease = Duration::from_millis(150);

    let crashed_holder = coordinator
        .try_acquire("nightly-report", Some(lease))
        .await
        .unwrap()
        .expect("acquired");
    // Simulate a holder that disappears without releasing
    std::mem::forget(crashed_holder);

    assert!(coordinator
        .try_acquire("nightly-report", Some(lease))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(lease + Duration::from_millis(50)).await;
    assert!(coordinator
        .try_acquire("nightly-report", Some(lease))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_quorum_tolerates_minority_outage() {
    let (stores, connector) = cluster();
    let coordinator = coordinator(connector, &NODES);
    coordinator.warm_up().await.unwrap();

    stores[2].set_online(false);
    let handle = coordinator
        .try_acquire("rebalance", None)
        .await
        .unwrap()
        .expect("two of three instances is a quorum");
    assert!(stores[0].value(15, "lock:rebalance").is_some());
    assert!(stores[1].value(15, "lock:rebalance").is_some());
    handle.release().await.unwrap();

    stores[1].set_online(false);
    assert!(matches!(
        coordinator.try_acquire("rebalance", None).await,
        Err(CacheError::Connectivity(_))
    ));
    assert!(stores[0].value(15, "lock:rebalance").is_none());
}

#[tokio::test]
async fn test_concurrent_factory_requests_rebuild_once() {
    let store = FakeStore::new();
    let connector = Arc::new(FakeConnector::new(store));
    connector.set_handshake_delay(Duration::from_millis(50));
    let coordinator = Arc::new(coordinator(Arc::clone(&connector), &[NODES[0]]));

    let requests = (0..50).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.try_get_lock_factory().await })
    });
    let factories: Vec<_> = join_all(requests)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    assert!(factories.iter().all(Option::is_some));
    assert_eq!(connector.connect_attempts(), 1);
    assert_eq!(coordinator.rebuild_attempts(), 1);
}

#[tokio::test]
async fn test_with_lock_serializes_critical_sections() {
    let (_stores, connector) = cluster();
    let coordinator = Arc::new(coordinator(connector, &NODES));
    let inside = Arc::new(AtomicU32::new(0));
    let completed = Arc::new(AtomicU32::new(0));

    let workers = (0..8).map(|_| {
        let coordinator = Arc::clone(&coordinator);
        let inside = Arc::clone(&inside);
        let completed = Arc::clone(&completed);
        tokio::spawn(async move {
            coordinator
                .with_lock("ledger", Some(Duration::from_secs(2)), || async {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .await
        })
    });

    for outcome in join_all(workers).await {
        outcome.unwrap().unwrap();
    }
    assert!(completed.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_extend_keeps_lock_alive() {
    let (_stores, connector) = cluster();
    let coordinator = coordinator(connector, &NODES);

    let mut handle = coordinator
        .try_acquire("migration", Some(Duration::from_millis(150)))
        .await
        .unwrap()
        .expect("acquired");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.extend(Duration::from_millis(300)).await.unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(handle.is_valid());
    assert!(coordinator
        .try_acquire("migration", None)
        .await
        .unwrap()
        .is_none());
    handle.release().await.unwrap();
}

#[tokio::test]
async fn test_cache_outage_does_not_block_locks() {
    init_tracing();
    let cache_store = FakeStore::new();
    let lock_store = FakeStore::new();
    let cache_connector: Arc<dyn StoreConnector> =
        Arc::new(FakeConnector::new(cache_store.clone()));
    let lock_connector: Arc<dyn StoreConnector> = Arc::new(FakeConnector::new(lock_store));

    let mut settings = CacheSettings::default();
    settings.store.url = Some("redis://cache:6379".to_string());
    settings.store.connect_retry = 1;
    settings.circuit_breaker.failure_threshold = 2;
    settings.lock.endpoints = vec![NODES[0].to_string()];

    let runtime = CacheRuntime::with_connectors(&settings, cache_connector, lock_connector);
    runtime.warm_up().await.unwrap();

    cache_store.set_online(false);
    for _ in 0..3 {
        let _ = runtime.cache().get("user:42", Tolerance::Lenient).await;
    }
    assert!(runtime.cache().executor().breaker().is_open());

    let handle = runtime
        .locks()
        .acquire("user:42", None)
        .await
        .unwrap()
        .expect("lock path is independent of the cache");
    handle.release().await.unwrap();
    runtime.shutdown().await;
}
