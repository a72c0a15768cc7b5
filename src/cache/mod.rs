//! # Cache Module
//!
//! Breaker-protected cache operations over a shared store connection.
//!
//! - [`OperationExecutor`]: the single choke point applying breaker policy, deadlines,
//!   and error classification
//! - [`ResilientCache`]: typed facade (get/set/delete/exists, bulk and serialized
//!   variants, TTL queries, pattern purges, health check)
//! - [`KeyScanner`] and [`BatchDeleter`]: bounded-memory key-space iteration and bulk
//!   deletion
//!
//! When the store is unreachable the circuit opens and every call fails fast: lenient
//! reads return `None`, lenient writes return `false`.
//!
//! ```rust
//! use resilient_cache::cache::{OperationExecutor, ResilientCache};
//! use resilient_cache::config::ScanConfig;
//! use resilient_cache::connection::{ConnectOptions, ConnectionManager, RedisConnector};
//! use resilient_cache::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use resilient_cache::Tolerance;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! // No address configured: every operation is a no-op
//! let connections = Arc::new(ConnectionManager::new(
//!     "cache",
//!     None,
//!     ConnectOptions::default(),
//!     Arc::new(RedisConnector::new()),
//! ));
//! let breaker = Arc::new(CircuitBreaker::new(
//!     "cache".to_string(),
//!     CircuitBreakerConfig::for_cache(),
//! ));
//! let executor = Arc::new(OperationExecutor::new(connections, breaker, Duration::from_secs(1)));
//! let cache = ResilientCache::new(executor, 0, ScanConfig::default(), "cache:health-check");
//!
//! assert!(!cache.set("user:42", "Ada", None, Tolerance::Lenient).await.unwrap());
//! assert_eq!(cache.get("user:42", Tolerance::Lenient).await.unwrap(), None);
//! assert!(cache.get("user:42", Tolerance::Strict).await.is_err());
//! # });
//! ```

pub mod client;
pub mod executor;
pub mod health;
pub mod purge;
pub mod scan;

pub use client::{escape_glob, CacheEntry, ResilientCache};
pub use executor::{validate_key, OperationExecutor};
pub use health::{HealthReport, HealthStatus};
pub use purge::{BatchDeleter, PurgeOutcome};
pub use scan::KeyScanner;
