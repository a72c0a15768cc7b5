//! # Distributed Locks
//!
//! Quorum-based advisory locks on a connection path independent of the cache.
//!
//! ```rust,no_run
//! # async fn example(coordinator: &resilient_cache::lock::LockCoordinator) -> resilient_cache::CacheResult<()> {
//! use std::time::Duration;
//!
//! if let Some(handle) = coordinator.acquire("billing:close-month", Some(Duration::from_secs(10))).await? {
//!     // ... critical section ...
//!     handle.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod factory;

pub use coordinator::LockCoordinator;
pub use factory::{clock_drift, LockFactory, LockHandle, LockPolicy, LOCK_KEY_PREFIX};
