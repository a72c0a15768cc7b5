//! # Quorum Lock Factory
//!
//! Advisory mutual exclusion over N independent store instances. A lock is held when
//! `SET key token NX PX lease` succeeded on a majority (`N/2 + 1`) of instances and
//! the time spent acquiring, plus an allowance for clock drift, still leaves part of
//! the lease. Anything less is rolled back with a compare-and-delete so a partial
//! acquisition never blocks other callers until its lease runs out.
//!
//! Release and extension only touch keys that still hold the caller's random token.
//! A holder that crashes simply lets its lease expire.

use crate::config::redact_url;
use crate::connection::{ConnectOptions, StoreConnection, StoreConnector};
use crate::error::{CacheError, CacheResult};
use crate::identity::ContainerIdentity;
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace for lock keys in the dedicated database
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Fixed drift allowance added on top of the proportional factor
const BASE_CLOCK_DRIFT: Duration = Duration::from_millis(2);

/// Lease and retry policy shared by every lock from one factory
#[derive(Debug, Clone, PartialEq)]
pub struct LockPolicy {
    pub database: i64,
    pub operation_timeout: Duration,
    pub default_lease: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub clock_drift_factor: f64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            database: 15,
            operation_timeout: Duration::from_secs(1),
            default_lease: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_millis(200),
            clock_drift_factor: 0.01,
        }
    }
}

/// Allowance for clock drift between instances over `lease`
pub fn clock_drift(lease: Duration, factor: f64) -> Duration {
    let proportional = if factor.is_finite() && factor > 0.0 {
        lease.mul_f64(factor)
    } else {
        Duration::ZERO
    };
    proportional + BASE_CLOCK_DRIFT
}

impl LockPolicy {
    fn drift(&self, lease: Duration) -> Duration {
        clock_drift(lease, self.clock_drift_factor)
    }

    /// Reject leases that could never leave any validity after drift
    fn check_lease(&self, lease: Duration) -> CacheResult<()> {
        let drift = self.drift(lease);
        if lease <= drift {
            return Err(CacheError::Validation(format!(
                "lock lease of {}ms does not exceed the {}ms clock drift allowance",
                lease.as_millis(),
                drift.as_millis()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct LockInstance {
    endpoint: String,
    connection: Arc<dyn StoreConnection>,
}

/// Connections to the lock quorum
#[derive(Debug)]
pub struct LockFactory {
    instances: Vec<LockInstance>,
    configured: usize,
    policy: LockPolicy,
    identity: ContainerIdentity,
}

impl LockFactory {
    /// Connect to every endpoint; `None` unless a quorum answered
    pub async fn connect(
        endpoints: &[String],
        connector: &Arc<dyn StoreConnector>,
        options: &ConnectOptions,
        policy: LockPolicy,
        identity: ContainerIdentity,
    ) -> Option<Self> {
        let attempts = endpoints.iter().map(|endpoint| async move {
            connect_instance(connector, endpoint, options)
                .await
                .map(|connection| LockInstance {
                    endpoint: redact_url(endpoint),
                    connection,
                })
        });
        let instances: Vec<LockInstance> = join_all(attempts).await.into_iter().flatten().collect();

        let factory = Self {
            instances,
            configured: endpoints.len(),
            policy,
            identity,
        };

        if factory.instances.len() < factory.quorum() {
            warn!(
                container = %factory.identity,
                connected = factory.instances.len(),
                configured = factory.configured,
                quorum = factory.quorum(),
                "Lock quorum unreachable"
            );
            factory.close().await;
            return None;
        }

        info!(
            container = %factory.identity,
            connected = factory.instances.len(),
            configured = factory.configured,
            database = factory.policy.database,
            "Lock factory ready"
        );
        Some(factory)
    }

    /// Majority of configured instances
    pub fn quorum(&self) -> usize {
        self.configured / 2 + 1
    }

    /// Healthy while a quorum of instances reports connected
    pub fn is_healthy(&self) -> bool {
        self.connected_instances() >= self.quorum()
    }

    pub fn connected_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|instance| instance.connection.is_connected())
            .count()
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    /// Single acquisition attempt
    ///
    /// `Ok(None)` when another holder owns the resource, `Err(Connectivity)` when too
    /// few instances answered to decide.
    pub async fn try_acquire(
        &self,
        resource: &str,
        lease: Duration,
    ) -> CacheResult<Option<LockHandle>> {
        if resource.trim().is_empty() {
            return Err(CacheError::Validation(
                "lock resource must not be empty".to_string(),
            ));
        }
        if lease.is_zero() {
            return Err(CacheError::Validation(
                "lock lease must be greater than zero".to_string(),
            ));
        }
        self.policy.check_lease(lease)?;

        let key = format!("{}{}", LOCK_KEY_PREFIX, resource);
        let token = Uuid::new_v4().to_string();
        let database = self.policy.database;
        let op_timeout = self.policy.operation_timeout;
        let started = Instant::now();

        let outcomes = join_all(self.instances.iter().map(|instance| {
            let (key, token) = (&key, &token);
            async move {
                bounded(
                    op_timeout,
                    instance
                        .connection
                        .set_if_absent(database, key, token.as_bytes(), lease),
                )
                .await
            }
        }))
        .await;

        let acquired = outcomes.iter().filter(|o| matches!(o, Ok(true))).count();
        let unreachable =
            outcomes.iter().filter(|o| o.is_err()).count() + (self.configured - self.instances.len());

        let validity = lease
            .checked_sub(started.elapsed() + self.policy.drift(lease))
            .unwrap_or_default();

        if acquired >= self.quorum() && !validity.is_zero() {
            debug!(
                resource = resource,
                acquired = acquired,
                validity_ms = validity.as_millis() as u64,
                "Lock acquired"
            );
            return Ok(Some(LockHandle {
                resource: resource.to_string(),
                key,
                token,
                instances: self.instances.iter().map(|i| Arc::clone(&i.connection)).collect(),
                quorum: self.quorum(),
                policy: self.policy.clone(),
                valid_until: started + validity,
                released: false,
            }));
        }

        // Roll back partial acquisitions
        if acquired > 0 {
            release_everywhere(&self.instances_connections(), database, op_timeout, &key, &token)
                .await;
        }

        if self.configured - unreachable.min(self.configured) < self.quorum() {
            return Err(CacheError::Connectivity(format!(
                "lock quorum unreachable: {} of {} instances answered",
                self.configured - unreachable.min(self.configured),
                self.configured
            )));
        }

        debug!(
            resource = resource,
            acquired = acquired,
            quorum = self.quorum(),
            "Lock contended"
        );
        Ok(None)
    }

    /// Acquire with the policy's retry count and delay
    pub async fn acquire(
        &self,
        resource: &str,
        lease: Option<Duration>,
    ) -> CacheResult<Option<LockHandle>> {
        self.acquire_with_retry(
            resource,
            lease.unwrap_or(self.policy.default_lease),
            self.policy.retry_count,
            self.policy.retry_delay,
        )
        .await
    }

    /// Retry contended or unreachable attempts up to `retry_count` extra times
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        lease: Duration,
        retry_count: u32,
        retry_delay: Duration,
    ) -> CacheResult<Option<LockHandle>> {
        let mut attempt = 0;
        loop {
            let outcome = self.try_acquire(resource, lease).await;
            match &outcome {
                Ok(Some(_)) | Err(CacheError::Validation(_)) => return outcome,
                _ if attempt >= retry_count => return outcome,
                _ => {}
            }
            attempt += 1;
            tokio::time::sleep(retry_delay).await;
        }
    }

    fn instances_connections(&self) -> Vec<Arc<dyn StoreConnection>> {
        self.instances
            .iter()
            .map(|instance| Arc::clone(&instance.connection))
            .collect()
    }

    /// Close every instance connection
    pub async fn close(&self) {
        for instance in &self.instances {
            debug!(endpoint = %instance.endpoint, "Closing lock connection");
            instance.connection.close().await;
        }
    }
}

async fn connect_instance(
    connector: &Arc<dyn StoreConnector>,
    endpoint: &str,
    options: &ConnectOptions,
) -> Option<Arc<dyn StoreConnection>> {
    let attempts = options.connect_retry.max(1);
    for attempt in 1..=attempts {
        match timeout(options.connect_timeout, connector.connect(endpoint, options)).await {
            Ok(Ok(connection)) => return Some(connection),
            Ok(Err(e)) if !e.trips_breaker() => {
                warn!(
                    endpoint = %redact_url(endpoint),
                    error = %e,
                    "Lock endpoint rejected without retry"
                );
                return None;
            }
            Ok(Err(e)) => debug!(
                endpoint = %redact_url(endpoint),
                attempt = attempt,
                error = %e,
                "Lock handshake failed"
            ),
            Err(_) => debug!(
                endpoint = %redact_url(endpoint),
                attempt = attempt,
                "Lock handshake timed out"
            ),
        }
    }
    None
}

async fn bounded<T>(
    limit: Duration,
    op: impl std::future::Future<Output = CacheResult<T>>,
) -> CacheResult<T> {
    match timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(CacheError::Timeout(format!(
            "lock operation exceeded {}ms",
            limit.as_millis()
        ))),
    }
}

/// Compare-and-delete on every instance; returns (released, failed)
async fn release_everywhere(
    instances: &[Arc<dyn StoreConnection>],
    database: i64,
    op_timeout: Duration,
    key: &str,
    token: &str,
) -> (usize, usize) {
    let outcomes = join_all(instances.iter().map(|connection| {
        bounded(
            op_timeout,
            connection.delete_if_equals(database, key, token.as_bytes()),
        )
    }))
    .await;

    let released = outcomes.iter().filter(|o| matches!(o, Ok(true))).count();
    let failed = outcomes.iter().filter(|o| o.is_err()).count();
    (released, failed)
}

/// A held lock; release it explicitly, or it is released in the background on drop
#[derive(Debug)]
pub struct LockHandle {
    resource: String,
    key: String,
    token: String,
    instances: Vec<Arc<dyn StoreConnection>>,
    quorum: usize,
    policy: LockPolicy,
    valid_until: Instant,
    released: bool,
}

impl LockHandle {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Random value identifying this holder
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Still inside the validity window computed at acquisition (or last extension)
    pub fn is_valid(&self) -> bool {
        !self.released && Instant::now() < self.valid_until
    }

    pub fn remaining_validity(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    /// Reset the lease on a quorum; `false` when the lock was already lost
    pub async fn extend(&mut self, lease: Duration) -> CacheResult<bool> {
        if self.released {
            return Ok(false);
        }
        self.policy.check_lease(lease)?;

        let started = Instant::now();
        let outcomes = join_all(self.instances.iter().map(|connection| {
            bounded(
                self.policy.operation_timeout,
                connection.expire_if_equals(
                    self.policy.database,
                    &self.key,
                    self.token.as_bytes(),
                    lease,
                ),
            )
        }))
        .await;

        let extended = outcomes.iter().filter(|o| matches!(o, Ok(true))).count();
        let failed = outcomes.iter().filter(|o| o.is_err()).count();

        if extended >= self.quorum {
            let validity = lease
                .checked_sub(started.elapsed() + self.policy.drift(lease))
                .unwrap_or_default();
            self.valid_until = started + validity;
            return Ok(true);
        }

        if self.instances.len() - failed < self.quorum {
            return Err(CacheError::Connectivity(format!(
                "lock quorum unreachable while extending {}",
                self.resource
            )));
        }
        Ok(false)
    }

    /// Release on every instance; `true` when a quorum still held our token
    pub async fn release(mut self) -> CacheResult<bool> {
        self.released = true;
        let (released, failed) = release_everywhere(
            &self.instances,
            self.policy.database,
            self.policy.operation_timeout,
            &self.key,
            &self.token,
        )
        .await;

        debug!(
            resource = %self.resource,
            released = released,
            failed = failed,
            "Lock released"
        );

        if failed == self.instances.len() {
            return Err(CacheError::Connectivity(format!(
                "no lock instance reachable to release {}",
                self.resource
            )));
        }
        Ok(released >= self.quorum)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                resource = %self.resource,
                "Lock handle dropped outside a runtime; lease will expire"
            );
            return;
        };

        let instances = std::mem::take(&mut self.instances);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let resource = std::mem::take(&mut self.resource);
        let database = self.policy.database;
        let op_timeout = self.policy.operation_timeout;

        runtime.spawn(async move {
            let (released, _) =
                release_everywhere(&instances, database, op_timeout, &key, &token).await;
            debug!(
                resource = %resource,
                released = released,
                "Dropped lock released in background"
            );
        });
    }
}
