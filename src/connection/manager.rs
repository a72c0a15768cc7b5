//! # Connection Manager
//!
//! Owns the single live handle to a store endpoint. The healthy path takes a read lock
//! and clones an `Arc`; only when the handle stops reporting connected does a caller
//! enter the async rebuild mutex, where it re-checks before disposing of the stale
//! handle and performing a fresh handshake.
//!
//! A generation counter is bumped after every rebuild attempt, successful or not.
//! Callers that queued behind the mutex compare it against the value they observed
//! before waiting and return the outcome of the rebuild they waited on instead of
//! starting another. This keeps at most one handshake in flight per outage window.

use super::{ConnectOptions, ConnectionEvent, StoreConnection, StoreConnector};
use crate::config::redact_url;
use crate::error::{CacheError, CacheResult};
use crate::identity::ContainerIdentity;
use crate::logging::log_connection_event;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lazily-created, rebuildable connection handle for one endpoint
#[derive(Debug)]
pub struct ConnectionManager {
    component: String,
    endpoint: Option<String>,
    options: ConnectOptions,
    connector: Arc<dyn StoreConnector>,
    current: RwLock<Option<Arc<dyn StoreConnection>>>,
    rebuild: Mutex<()>,
    generation: AtomicU64,
    rebuild_attempts: AtomicU64,
    ever_connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    identity: ContainerIdentity,
    clock_origin: Instant,
    last_used_nanos: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager; no network activity happens until the first request
    pub fn new(
        component: impl Into<String>,
        endpoint: Option<String>,
        options: ConnectOptions,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let component = component.into();
        let identity = ContainerIdentity::process();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        match &endpoint {
            Some(url) => debug!(
                component = %component,
                container = %identity,
                endpoint = %redact_url(url),
                database = options.database,
                "Connection manager created"
            ),
            None => info!(
                component = %component,
                container = %identity,
                "No store address configured - operations degrade to no-ops"
            ),
        }

        Self {
            component,
            endpoint,
            options,
            connector,
            current: RwLock::new(None),
            rebuild: Mutex::new(()),
            generation: AtomicU64::new(0),
            rebuild_attempts: AtomicU64::new(0),
            ever_connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            identity,
            clock_origin: Instant::now(),
            last_used_nanos: AtomicU64::new(0),
        }
    }

    /// Return the live handle, rebuilding it if needed
    ///
    /// `None` when no endpoint is configured, the manager was closed, or the handshake
    /// failed. Network failures are logged and published, never returned.
    pub async fn get_connection(&self) -> Option<Arc<dyn StoreConnection>> {
        if self.endpoint.is_none() || self.closed.load(Ordering::Acquire) {
            return None;
        }

        let observed_generation = self.generation.load(Ordering::Acquire);

        let mut unresponsive = None;
        if let Some(connection) = self.live_handle() {
            if self.keep_alive_passes(&connection).await {
                self.touch();
                return Some(connection);
            }
            unresponsive = Some(connection);
        }

        self.rebuild_connection(observed_generation, unresponsive)
            .await
    }

    /// Current handle without any liveness check or rebuild
    pub fn current(&self) -> Option<Arc<dyn StoreConnection>> {
        self.current.read().clone()
    }

    /// Whether an endpoint is configured at all
    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether the current handle reports connected
    pub fn is_healthy(&self) -> bool {
        self.live_handle().is_some()
    }

    /// Eagerly establish the connection
    pub async fn connect(&self) -> CacheResult<()> {
        if !self.is_configured() {
            return Err(CacheError::ConfigurationMissing(format!(
                "no endpoint configured for {}",
                self.component
            )));
        }
        match self.get_connection().await {
            Some(_) => Ok(()),
            None => Err(CacheError::Connectivity(format!(
                "unable to connect {}",
                self.component
            ))),
        }
    }

    /// Receive lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Number of handshakes started since creation
    pub fn rebuild_attempts(&self) -> u64 {
        self.rebuild_attempts.load(Ordering::Relaxed)
    }

    /// Logical database selected on new handles
    pub fn database(&self) -> i64 {
        self.options.database
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn identity(&self) -> &ContainerIdentity {
        &self.identity
    }

    /// Dispose of the handle; the manager hands out nothing afterwards
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _guard = self.rebuild.lock().await;
        let previous = self.current.write().take();
        if let Some(connection) = previous {
            connection.close().await;
        }

        self.publish(ConnectionEvent::Closed {
            component: self.component.clone(),
        });
    }

    fn live_handle(&self) -> Option<Arc<dyn StoreConnection>> {
        self.current
            .read()
            .as_ref()
            .filter(|connection| connection.is_connected())
            .cloned()
    }

    fn touch(&self) {
        let now = self.clock_origin.elapsed().as_nanos() as u64;
        self.last_used_nanos.store(now, Ordering::Relaxed);
    }

    async fn keep_alive_passes(&self, connection: &Arc<dyn StoreConnection>) -> bool {
        let now = self.clock_origin.elapsed().as_nanos() as u64;
        let last = self.last_used_nanos.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.options.keep_alive.as_nanos() as u64 {
            return true;
        }

        match timeout(
            self.options.connect_timeout,
            connection.ping(self.options.database),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(component = %self.component, error = %e, "Keep-alive ping failed");
                false
            }
            Err(_) => {
                debug!(component = %self.component, "Keep-alive ping timed out");
                false
            }
        }
    }

    /// Replace the handle unless someone already did
    ///
    /// `unresponsive` is a handle that failed its keep-alive ping; it is discarded even
    /// if it still reports connected.
    async fn rebuild_connection(
        &self,
        observed_generation: u64,
        unresponsive: Option<Arc<dyn StoreConnection>>,
    ) -> Option<Arc<dyn StoreConnection>> {
        let _guard = self.rebuild.lock().await;

        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // Someone rebuilt (or tried to) while we waited
        if self.generation.load(Ordering::Acquire) != observed_generation {
            return self.live_handle();
        }

        if let Some(connection) = self.live_handle() {
            let failed_keep_alive = unresponsive
                .as_ref()
                .is_some_and(|suspect| Arc::ptr_eq(suspect, &connection));
            if !failed_keep_alive {
                self.touch();
                return Some(connection);
            }
        }

        let endpoint = self.endpoint.as_deref()?;

        let stale = self.current.write().take();
        if let Some(stale) = stale {
            self.publish(ConnectionEvent::InternalError {
                component: self.component.clone(),
                error: "connection lost, discarding handle".to_string(),
            });
            stale.close().await;
        }

        self.rebuild_attempts.fetch_add(1, Ordering::Relaxed);
        let attempts = self.options.connect_retry.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let outcome = timeout(
                self.options.connect_timeout,
                self.connector.connect(endpoint, &self.options),
            )
            .await;

            match outcome {
                Ok(Ok(connection)) => {
                    *self.current.write() = Some(Arc::clone(&connection));
                    let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                    self.touch();

                    let event = if self.ever_connected.swap(true, Ordering::AcqRel) {
                        ConnectionEvent::Restored {
                            component: self.component.clone(),
                            endpoint: redact_url(endpoint),
                            generation,
                        }
                    } else {
                        ConnectionEvent::Established {
                            component: self.component.clone(),
                            endpoint: redact_url(endpoint),
                        }
                    };
                    self.publish(event);
                    return Some(connection);
                }
                Ok(Err(e)) if !e.trips_breaker() => {
                    last_error = e.to_string();
                    debug!(
                        component = %self.component,
                        error_kind = e.label(),
                        "Handshake failure is not transient, skipping retries"
                    );
                    break;
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!(
                        "handshake timed out after {}ms",
                        self.options.connect_timeout.as_millis()
                    )
                }
            }

            debug!(
                component = %self.component,
                attempt = attempt,
                max_attempts = attempts,
                error = %last_error,
                "Handshake attempt failed"
            );
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        warn!(
            component = %self.component,
            container = %self.identity,
            endpoint = %redact_url(endpoint),
            attempts = attempts,
            error = %last_error,
            "Failed to establish store connection"
        );
        self.publish(ConnectionEvent::Failed {
            component: self.component.clone(),
            endpoint: redact_url(endpoint),
            error: last_error,
        });
        None
    }

    fn publish(&self, event: ConnectionEvent) {
        let details = match &event {
            ConnectionEvent::Failed { error, .. } | ConnectionEvent::InternalError { error, .. } => {
                Some(error.as_str())
            }
            _ => None,
        };
        let endpoint = self.endpoint.as_deref().map(redact_url);
        log_connection_event(
            &self.component,
            &self.identity,
            event.name(),
            endpoint.as_deref(),
            details,
        );
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeConnector, FakeStore};
    use std::time::Duration;

    fn manager(connector: Arc<FakeConnector>, endpoint: Option<&str>) -> ConnectionManager {
        keep_alive_manager(connector, endpoint, ConnectOptions::default().keep_alive)
    }

    fn keep_alive_manager(
        connector: Arc<FakeConnector>,
        endpoint: Option<&str>,
        keep_alive: Duration,
    ) -> ConnectionManager {
        ConnectionManager::new(
            "cache",
            endpoint.map(str::to_string),
            ConnectOptions {
                connect_timeout: Duration::from_millis(100),
                connect_retry: 2,
                keep_alive,
                ..ConnectOptions::default()
            },
            connector,
        )
    }

    #[tokio::test]
    async fn test_no_endpoint_is_permanent_none() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let manager = manager(Arc::clone(&connector), None);

        assert!(manager.get_connection().await.is_none());
        assert!(!manager.is_configured());
        assert!(matches!(
            manager.connect().await,
            Err(CacheError::ConfigurationMissing(_))
        ));
        assert_eq!(connector.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_connection_is_reused_while_live() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let manager = manager(Arc::clone(&connector), Some("redis://fake"));
        let mut events = manager.subscribe();

        assert!(manager.get_connection().await.is_some());
        assert!(manager.get_connection().await.is_some());
        assert_eq!(connector.connect_attempts(), 1);
        assert_eq!(manager.rebuild_attempts(), 1);
        assert!(manager.is_healthy());
        assert_eq!(events.recv().await.unwrap().name(), "established");
    }

    #[tokio::test]
    async fn test_handshake_failure_retries_then_returns_none() {
        let store = FakeStore::new();
        store.set_online(false);
        let connector = Arc::new(FakeConnector::new(store));
        let manager = manager(Arc::clone(&connector), Some("redis://fake"));
        let mut events = manager.subscribe();

        assert!(manager.get_connection().await.is_none());
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(events.recv().await.unwrap().name(), "failed");
        assert!(matches!(
            manager.connect().await,
            Err(CacheError::Connectivity(_))
        ));
    }

    #[tokio::test]
    async fn test_permanent_handshake_error_is_not_retried() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        connector.set_handshake_error(Some(CacheError::ConfigurationMissing(
            "Invalid store address".to_string(),
        )));
        let manager = manager(Arc::clone(&connector), Some("redis://fake"));

        assert!(manager.get_connection().await.is_none());
        assert_eq!(connector.connect_attempts(), 1);

        connector.set_handshake_error(None);
        assert!(manager.get_connection().await.is_some());
    }

    #[tokio::test]
    async fn test_lost_connection_is_rebuilt_once() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let manager = Arc::new(manager(Arc::clone(&connector), Some("redis://fake")));
        let first = manager.get_connection().await.unwrap();

        store.set_online(false);
        assert!(first.get(0, "k").await.is_err());
        assert!(!first.is_connected());
        store.set_online(true);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.get_connection().await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_some());
        }

        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(manager.rebuild_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_disposes_handle() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let manager = manager(Arc::clone(&connector), Some("redis://fake"));
        let connection = manager.get_connection().await.unwrap();

        manager.close().await;
        assert!(!connection.is_connected());
        assert!(manager.get_connection().await.is_none());
        assert!(manager.current().is_none());
        assert_eq!(connector.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_idle_handle_failing_ping_is_restored() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let manager = keep_alive_manager(
            Arc::clone(&connector),
            Some("redis://fake"),
            Duration::from_millis(1),
        );
        let mut events = manager.subscribe();
        assert!(manager.get_connection().await.is_some());

        store.set_online(false);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(manager.get_connection().await.is_none());
        assert!(store.calls("PING") >= 1);

        store.set_online(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let restored = manager.get_connection().await.unwrap();
        assert!(restored.is_connected());

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|event| event.name())
            .collect();
        assert_eq!(
            names,
            vec!["established", "internal_error", "failed", "restored"]
        );
        assert_eq!(connector.connect_attempts(), 4);
    }

    #[tokio::test]
    async fn test_slow_keep_alive_ping_forces_rebuild() {
        let store = FakeStore::new();
        let connector = Arc::new(FakeConnector::new(store.clone()));
        let manager = keep_alive_manager(
            Arc::clone(&connector),
            Some("redis://fake"),
            Duration::from_millis(1),
        );
        let first = manager.get_connection().await.unwrap();

        // Slower than the 100ms connect timeout, but the handle never errors
        store.set_latency(Duration::from_millis(150));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager.get_connection().await.unwrap();
        store.set_latency(Duration::ZERO);

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(connector.connect_attempts(), 2);
        assert_eq!(manager.rebuild_attempts(), 2);
    }

    #[tokio::test]
    async fn test_close_is_observable() {
        let connector = Arc::new(FakeConnector::new(FakeStore::new()));
        let manager = manager(connector, Some("redis://fake"));
        assert!(!manager.is_closed());

        manager.close().await;
        assert!(manager.is_closed());
        assert!(manager.is_configured());
    }
}
