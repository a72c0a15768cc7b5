//! # Lock Coordinator
//!
//! Owns the lock factory and its connections, fully independent of the cache: its own
//! endpoints, its own database index, tighter timeouts, and no shared breaker. A cache
//! outage never blocks a lock attempt, and a lock-store outage never trips the cache.
//!
//! The factory is reused while a quorum of its connections reports healthy. Rebuilds
//! follow the same discipline as [`crate::connection::ConnectionManager`]: read lock on
//! the healthy path, async mutex plus generation check on the rebuild path, so a burst
//! of callers during an outage produces a single reconnection attempt.

use super::factory::{LockFactory, LockHandle, LockPolicy};
use crate::config::CacheSettings;
use crate::connection::{ConnectOptions, StoreConnector};
use crate::error::{CacheError, CacheResult};
use crate::identity::ContainerIdentity;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct LockCoordinator {
    endpoints: Vec<String>,
    options: ConnectOptions,
    policy: LockPolicy,
    connector: Arc<dyn StoreConnector>,
    factory: RwLock<Option<Arc<LockFactory>>>,
    rebuild: Mutex<()>,
    generation: AtomicU64,
    rebuild_attempts: AtomicU64,
    closed: AtomicBool,
    identity: ContainerIdentity,
}

impl LockCoordinator {
    pub fn new(
        endpoints: Vec<String>,
        options: ConnectOptions,
        policy: LockPolicy,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let identity = ContainerIdentity::process();
        if endpoints.is_empty() {
            info!(
                container = %identity,
                "No lock endpoints configured - distributed locks disabled"
            );
        }

        Self {
            endpoints,
            options,
            policy,
            connector,
            factory: RwLock::new(None),
            rebuild: Mutex::new(()),
            generation: AtomicU64::new(0),
            rebuild_attempts: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            identity,
        }
    }

    /// Build from the lock section of the settings
    pub fn from_settings(settings: &CacheSettings, connector: Arc<dyn StoreConnector>) -> Self {
        let lock = &settings.lock;
        Self::new(
            settings.lock_endpoints(),
            ConnectOptions {
                database: lock.database,
                connect_timeout: lock.connect_timeout(),
                connect_retry: lock.connect_retry,
                keep_alive: settings.store.keep_alive(),
            },
            LockPolicy {
                database: lock.database,
                operation_timeout: lock.operation_timeout(),
                default_lease: lock.default_lease(),
                retry_count: lock.retry_count,
                retry_delay: lock.retry_delay(),
                clock_drift_factor: lock.clock_drift_factor,
            },
            connector,
        )
    }

    /// Healthy factory, rebuilding it if needed; `None` when unconfigured or unreachable
    pub async fn try_get_lock_factory(&self) -> Option<Arc<LockFactory>> {
        if self.endpoints.is_empty() || self.closed.load(Ordering::Acquire) {
            return None;
        }

        let observed_generation = self.generation.load(Ordering::Acquire);
        if let Some(factory) = self.healthy_factory() {
            return Some(factory);
        }

        let _guard = self.rebuild.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        if self.generation.load(Ordering::Acquire) != observed_generation {
            return self.healthy_factory();
        }

        if let Some(factory) = self.healthy_factory() {
            return Some(factory);
        }

        let stale = self.factory.write().take();
        if let Some(stale) = stale {
            debug!(container = %self.identity, "Discarding unhealthy lock factory");
            stale.close().await;
        }

        self.rebuild_attempts.fetch_add(1, Ordering::Relaxed);
        let rebuilt = LockFactory::connect(
            &self.endpoints,
            &self.connector,
            &self.options,
            self.policy.clone(),
            self.identity.clone(),
        )
        .await
        .map(Arc::new);

        if let Some(factory) = &rebuilt {
            *self.factory.write() = Some(Arc::clone(factory));
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        rebuilt
    }

    fn healthy_factory(&self) -> Option<Arc<LockFactory>> {
        self.factory
            .read()
            .as_ref()
            .filter(|factory| factory.is_healthy())
            .cloned()
    }

    /// Pre-establish the lock connections
    pub async fn warm_up(&self) -> CacheResult<()> {
        if self.endpoints.is_empty() {
            return Err(CacheError::ConfigurationMissing(
                "no lock endpoints configured".to_string(),
            ));
        }
        match self.try_get_lock_factory().await {
            Some(_) => Ok(()),
            None => Err(CacheError::Connectivity(
                "lock quorum unreachable".to_string(),
            )),
        }
    }

    async fn factory_or_error(&self) -> CacheResult<Arc<LockFactory>> {
        if self.endpoints.is_empty() {
            return Err(CacheError::ConfigurationMissing(
                "no lock endpoints configured".to_string(),
            ));
        }
        self.try_get_lock_factory()
            .await
            .ok_or_else(|| CacheError::Connectivity("lock quorum unreachable".to_string()))
    }

    /// Acquire with the configured retries; `Ok(None)` when the resource stays contended
    pub async fn acquire(
        &self,
        resource: &str,
        lease: Option<Duration>,
    ) -> CacheResult<Option<LockHandle>> {
        self.factory_or_error().await?.acquire(resource, lease).await
    }

    /// Single attempt without retries
    pub async fn try_acquire(
        &self,
        resource: &str,
        lease: Option<Duration>,
    ) -> CacheResult<Option<LockHandle>> {
        let factory = self.factory_or_error().await?;
        let lease = lease.unwrap_or(factory.policy().default_lease);
        factory.try_acquire(resource, lease).await
    }

    /// Run `work` while holding the lock; `Ok(None)` if it could not be acquired
    ///
    /// The lock is released on completion. If the future is dropped mid-flight the
    /// handle's drop schedules a background release.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        lease: Option<Duration>,
        work: F,
    ) -> CacheResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.acquire(resource, lease).await? else {
            return Ok(None);
        };

        let output = work().await;

        match handle.release().await {
            Ok(true) => {}
            Ok(false) => warn!(
                resource = resource,
                "Lock expired or was taken over before release"
            ),
            Err(e) => warn!(
                resource = resource,
                error = %e,
                "Lock release failed; lease will expire"
            ),
        }
        Ok(Some(output))
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy_factory().is_some()
    }

    pub fn rebuild_attempts(&self) -> u64 {
        self.rebuild_attempts.load(Ordering::Relaxed)
    }

    /// Close the factory's connections; no factory is handed out afterwards
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.rebuild.lock().await;
        let factory = self.factory.write().take();
        if let Some(factory) = factory {
            factory.close().await;
        }
        info!(container = %self.identity, "Lock coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeConnector, FakeStore};

    fn coordinator(connector: Arc<FakeConnector>, endpoints: &[&str]) -> LockCoordinator {
        LockCoordinator::new(
            endpoints.iter().map(|e| e.to_string()).collect(),
            ConnectOptions {
                database: 15,
                connect_retry: 1,
                ..ConnectOptions::default()
            },
            LockPolicy {
                retry_count: 0,
                ..LockPolicy::default()
            },
            connector,
        )
    }

    #[tokio::test]
    async fn test_unconfigured_coordinator() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let coordinator = coordinator(connector, &[]);

        assert!(coordinator.try_get_lock_factory().await.is_none());
        assert!(matches!(
            coordinator.warm_up().await,
            Err(CacheError::ConfigurationMissing(_))
        ));
        assert!(matches!(
            coordinator.acquire("job", None).await,
            Err(CacheError::ConfigurationMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_factory_is_reused_while_healthy() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let coordinator = coordinator(Arc::clone(&connector), &["redis://lock:6379"]);

        coordinator.warm_up().await.unwrap();
        let first = coordinator.try_get_lock_factory().await.unwrap();
        let second = coordinator.try_get_lock_factory().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(coordinator.rebuild_attempts(), 1);
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_afterwards() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let coordinator = coordinator(connector, &["redis://lock:6379"]);

        let result = coordinator
            .with_lock("nightly-report", None, || async {
                assert!(store.value(15, "lock:nightly-report").is_some());
                7
            })
            .await
            .unwrap();

        assert_eq!(result, Some(7));
        assert!(store.value(15, "lock:nightly-report").is_none());
    }

    #[tokio::test]
    async fn test_with_lock_returns_output_when_lock_was_lost() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let coordinator = coordinator(connector, &["redis://lock:6379"]);

        let result = coordinator
            .with_lock("nightly-report", None, || async {
                // Lease taken over by another owner mid-work
                store.insert(15, "lock:nightly-report", b"other-owner", None);
                7
            })
            .await
            .unwrap();

        assert_eq!(result, Some(7));
        assert_eq!(
            store.value(15, "lock:nightly-report"),
            Some(b"other-owner".to_vec())
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let coordinator = coordinator(connector, &["redis://lock:6379"]);
        let factory = coordinator.try_get_lock_factory().await.unwrap();

        coordinator.shutdown().await;
        assert!(!factory.is_healthy());
        assert!(coordinator.try_get_lock_factory().await.is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_factory_is_rebuilt() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let coordinator = coordinator(Arc::clone(&connector), &["redis://lock:6379"]);
        let factory = coordinator.try_get_lock_factory().await.unwrap();

        store.set_online(false);
        assert!(factory.try_acquire("job", Duration::from_secs(1)).await.is_err());
        assert!(!factory.is_healthy());
        assert!(coordinator.try_get_lock_factory().await.is_none());

        store.set_online(true);
        assert!(coordinator.try_get_lock_factory().await.is_some());
        assert_eq!(coordinator.rebuild_attempts(), 3);
    }
}
