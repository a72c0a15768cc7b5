//! # Cache Runtime
//!
//! Wires settings into a ready-to-use cache client and lock coordinator. Nothing
//! connects at construction time; the embedding application may call
//! [`CacheRuntime::warm_up`] at startup and must call [`CacheRuntime::shutdown`] on
//! termination to close both connections.

use crate::cache::{HealthReport, HealthStatus, OperationExecutor, ResilientCache};
use crate::config::CacheSettings;
use crate::connection::{ConnectOptions, ConnectionManager, RedisConnector, StoreConnector};
use crate::error::CacheResult;
use crate::identity::ContainerIdentity;
use crate::lock::LockCoordinator;
use crate::resilience::CircuitBreaker;
use std::sync::Arc;
use tracing::{info, warn};

/// Component name used for the cache connection and breaker
pub const CACHE_COMPONENT: &str = "cache";

#[derive(Debug, Clone)]
pub struct CacheRuntime {
    cache: ResilientCache,
    connections: Arc<ConnectionManager>,
    locks: Arc<LockCoordinator>,
    identity: ContainerIdentity,
}

impl CacheRuntime {
    /// Build against Redis-protocol endpoints
    pub fn from_settings(settings: &CacheSettings) -> Self {
        let connector: Arc<dyn StoreConnector> = Arc::new(RedisConnector::new());
        Self::with_connectors(settings, Arc::clone(&connector), connector)
    }

    /// Build with injected connectors (one for the cache, one for the lock quorum)
    pub fn with_connectors(
        settings: &CacheSettings,
        cache_connector: Arc<dyn StoreConnector>,
        lock_connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let store = &settings.store;
        let identity = ContainerIdentity::process();

        let connections = Arc::new(ConnectionManager::new(
            CACHE_COMPONENT,
            store.url.clone(),
            ConnectOptions {
                database: store.default_database,
                connect_timeout: store.connect_timeout(),
                connect_retry: store.connect_retry,
                keep_alive: store.keep_alive(),
            },
            cache_connector,
        ));

        let breaker = Arc::new(CircuitBreaker::new(
            CACHE_COMPONENT.to_string(),
            settings.circuit_breaker.to_breaker_config(),
        ));

        let executor = Arc::new(OperationExecutor::new(
            Arc::clone(&connections),
            breaker,
            store.operation_timeout(),
        ));

        let cache = ResilientCache::new(
            executor,
            store.default_database,
            settings.scan.clone(),
            store.health_check_key.clone(),
        );

        let locks = Arc::new(LockCoordinator::from_settings(settings, lock_connector));

        info!(
            container = %identity,
            cache_configured = connections.is_configured(),
            lock_configured = locks.is_configured(),
            "Cache runtime created"
        );

        Self {
            cache,
            connections,
            locks,
            identity,
        }
    }

    /// Cache client on the default database
    pub fn cache(&self) -> &ResilientCache {
        &self.cache
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.locks
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Eagerly establish the lock connection (and the cache connection if configured)
    ///
    /// Failures are logged; the runtime keeps working in degraded mode.
    pub async fn warm_up(&self) -> CacheResult<()> {
        if self.connections.is_configured() {
            if let Err(e) = self.connections.connect().await {
                warn!(container = %self.identity, error = %e, "Cache warm-up failed");
            }
        }

        let result = self.locks.warm_up().await;
        if let Err(e) = &result {
            warn!(container = %self.identity, error = %e, "Lock warm-up failed");
        }
        result
    }

    /// Round-trip the cache and report lock quorum health
    pub async fn health_check(&self) -> HealthReport {
        let cache = self.cache.health_check().await;
        let lock = if !self.locks.is_configured() {
            HealthStatus::Degraded
        } else if self.locks.try_get_lock_factory().await.is_some() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        HealthReport::new(
            cache,
            lock,
            self.cache.circuit_state(),
            self.cache.operations_completed(),
            &self.identity,
        )
    }

    /// Close the cache and lock connections
    pub async fn shutdown(&self) {
        self.connections.close().await;
        self.locks.shutdown().await;
        info!(
            container = %self.identity,
            operations_completed = self.cache.operations_completed(),
            "Cache runtime shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Tolerance};
    use crate::resilience::CircuitState;
    use crate::test_utils::{FakeConnector, FakeStore};

    fn settings() -> CacheSettings {
        let mut settings = CacheSettings::default();
        settings.store.url = Some("redis://cache:6379".to_string());
        settings
    }

    #[tokio::test]
    async fn test_cache_and_locks_use_separate_databases() {
        let store = FakeStore::new();
        let connector: Arc<dyn StoreConnector> = Arc::new(FakeConnector::new(store.clone()));
        let runtime =
            CacheRuntime::with_connectors(&settings(), Arc::clone(&connector), connector);

        runtime.warm_up().await.unwrap();
        runtime
            .cache()
            .set("k", "v", None, Tolerance::Strict)
            .await
            .unwrap();
        let handle = runtime.locks().acquire("k", None).await.unwrap().unwrap();

        assert_eq!(store.value(0, "k"), Some(b"v".to_vec()));
        assert!(store.value(15, "lock:k").is_some());
        handle.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_report() {
        let store = FakeStore::new();
        let connector: Arc<dyn StoreConnector> = Arc::new(FakeConnector::new(store));
        let runtime =
            CacheRuntime::with_connectors(&settings(), Arc::clone(&connector), connector);

        let report = runtime.health_check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.cache, HealthStatus::Healthy);
        assert_eq!(report.lock, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unconfigured_runtime_is_degraded_noop() {
        let connector: Arc<dyn StoreConnector> = Arc::new(FakeConnector::new(FakeStore::new()));
        let runtime = CacheRuntime::with_connectors(
            &CacheSettings::default(),
            Arc::clone(&connector),
            connector,
        );

        assert_eq!(
            runtime.cache().get("k", Tolerance::Lenient).await.unwrap(),
            None
        );
        assert!(!runtime
            .cache()
            .set("k", "v", None, Tolerance::Lenient)
            .await
            .unwrap());
        let report = runtime.health_check().await;
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_shutdown_closes_both_connections() {
        let store = FakeStore::new();
        let connector: Arc<dyn StoreConnector> = Arc::new(FakeConnector::new(store));
        let runtime =
            CacheRuntime::with_connectors(&settings(), Arc::clone(&connector), connector);
        runtime.warm_up().await.unwrap();

        runtime.shutdown().await;
        assert!(!runtime.connections().is_healthy());
        assert!(!runtime.locks().is_healthy());
        assert_eq!(
            runtime.cache().get("k", Tolerance::Lenient).await.unwrap(),
            None
        );
        assert!(matches!(
            runtime.cache().get("k", Tolerance::Strict).await,
            Err(CacheError::ConfigurationMissing(_))
        ));
        assert_eq!(runtime.cache().circuit_state(), CircuitState::Closed);
    }
}
