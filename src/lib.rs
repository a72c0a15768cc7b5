#![allow(clippy::doc_markdown)] // Allow technical terms like Redis, Redlock in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Resilient Cache
//!
//! Fault-tolerant client for a shared Redis-protocol key-value store, plus quorum-based
//! distributed locks on a separate connection path.
//!
//! ## Overview
//!
//! Applications treat the cache as an optimization, never as a dependency: when the
//! store is slow or down, calls fail fast through a circuit breaker and lenient callers
//! get empty results instead of errors. Locks use their own endpoints, database and
//! timeouts so a cache outage never blocks coordination.
//!
//! ## Module Organization
//!
//! - [`codec`] - Binary value encoding for typed entries
//! - [`connection`] - Store connections, double-checked rebuild, lifecycle events
//! - [`resilience`] - Circuit breaker with single-probe half-open state
//! - [`cache`] - Operation executor, typed client, key scanning, batched purges
//! - [`lock`] - Quorum lock factory and coordinator
//! - [`config`] - Layered settings (defaults, TOML file, environment)
//! - [`runtime`] - Wires everything together with warm-up, health and shutdown hooks
//! - [`error`] - Error taxonomy and strict/lenient failure handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilient_cache::{load_settings, CacheRuntime, Tolerance};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = load_settings()?;
//! let runtime = CacheRuntime::from_settings(&settings);
//! runtime.warm_up().await.ok();
//!
//! runtime.cache().set("user:42", "Ada", None, Tolerance::Lenient).await?;
//! let name = runtime.cache().get("user:42", Tolerance::Lenient).await?;
//! assert_eq!(name.as_deref(), Some("Ada"));
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --features test-utils                   # Unit and scenario tests
//! cargo test --features test-services                # Against a live store (REDIS_URL)
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod lock;
pub mod logging;
pub mod resilience;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::{
    CacheEntry, HealthReport, HealthStatus, KeyScanner, OperationExecutor, PurgeOutcome,
    ResilientCache,
};
pub use config::{load_settings, load_settings_from, CacheSettings, ConfigurationError};
pub use connection::{ConnectionEvent, ConnectionManager, StoreConnection, StoreConnector};
pub use error::{CacheError, CacheResult, Tolerance};
pub use identity::ContainerIdentity;
pub use lock::{LockCoordinator, LockHandle};
pub use logging::init_structured_logging;
pub use resilience::{CircuitBreaker, CircuitState};
pub use runtime::CacheRuntime;
