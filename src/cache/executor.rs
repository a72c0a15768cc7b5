//! # Operation Executor
//!
//! Single choke point for every cache read, write, and delete. Each call:
//!
//! 1. asks the circuit breaker whether to attempt (rejections never touch the network)
//! 2. borrows the shared connection from the [`ConnectionManager`]
//! 3. runs the operation under the configured deadline
//! 4. reports the outcome to the breaker and counts completed operations
//!
//! Errors come back tagged; the caller's [`Tolerance`] decides whether they surface.

use crate::connection::{ConnectionManager, StoreConnection};
use crate::error::{CacheError, CacheResult, Tolerance};
use crate::logging::log_operation_failure;
use crate::resilience::{Attempt, CircuitBreaker, CircuitState, FailureKind};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Reject keys that are empty or whitespace-only
pub fn validate_key(key: &str) -> CacheResult<()> {
    if key.trim().is_empty() {
        return Err(CacheError::Validation(
            "cache key must not be empty or whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Breaker-guarded executor over a shared connection
#[derive(Debug)]
pub struct OperationExecutor {
    connections: Arc<ConnectionManager>,
    breaker: Arc<CircuitBreaker>,
    operation_timeout: Duration,
    operations: AtomicU64,
}

impl OperationExecutor {
    pub fn new(
        connections: Arc<ConnectionManager>,
        breaker: Arc<CircuitBreaker>,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            breaker,
            operation_timeout,
            operations: AtomicU64::new(0),
        }
    }

    /// Validate `key`, run `op`, then apply `tolerance`
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        key: &str,
        tolerance: Tolerance,
        op: F,
    ) -> CacheResult<T>
    where
        T: Default,
        F: FnOnce(Arc<dyn StoreConnection>) -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let result = match validate_key(key) {
            Ok(()) => self.run(operation, Some(key), op).await,
            Err(e) => Err(e),
        };
        tolerance.resolve(result, operation, key)
    }

    /// Run one remote operation through the breaker; always strict
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        key: Option<&str>,
        op: F,
    ) -> CacheResult<T>
    where
        F: FnOnce(Arc<dyn StoreConnection>) -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let Some(attempt) = self.breaker.should_attempt() else {
            self.breaker.record_rejection();
            return Err(CacheError::CircuitOpen {
                component: self.breaker.name().to_string(),
            });
        };

        let started = Instant::now();

        let Some(connection) = self.connections.get_connection().await else {
            if !self.connections.is_configured() {
                return Err(CacheError::ConfigurationMissing(format!(
                    "no store address configured for {}",
                    self.connections.component()
                )));
            }
            if self.connections.is_closed() {
                return Err(CacheError::ConfigurationMissing(format!(
                    "{} connection has been shut down",
                    self.connections.component()
                )));
            }
            let error = CacheError::Connectivity("store connection unavailable".to_string());
            self.report_failure(attempt, operation, key, &error, started.elapsed());
            return Err(error);
        };

        let result = match timeout(self.operation_timeout, op(connection)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                self.operation_timeout.as_millis()
            ))),
        };

        match result {
            Ok(value) => {
                self.breaker.record_success(attempt, started.elapsed());
                self.operations.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(error) => {
                self.report_failure(attempt, operation, key, &error, started.elapsed());
                Err(error)
            }
        }
    }

    fn report_failure(
        &self,
        attempt: Attempt,
        operation: &str,
        key: Option<&str>,
        error: &CacheError,
        elapsed: Duration,
    ) {
        let kind = error.failure_kind();
        let tripped = self.breaker.record_failure(attempt, kind, elapsed);

        if tripped {
            log_operation_failure(
                self.breaker.name(),
                self.connections.identity(),
                operation,
                key,
                error.label(),
                &error.to_string(),
            );
        } else if kind != FailureKind::Application {
            debug!(
                component = %self.breaker.name(),
                operation = operation,
                error_kind = error.label(),
                "Store failure did not change circuit state"
            );
        }
    }

    /// Operations completed successfully since start
    pub fn operations_completed(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}
