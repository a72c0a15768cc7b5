//! # Connection Layer
//!
//! The store is reached through two object-safe traits so the runtime can be built
//! against a real Redis-protocol server or an in-memory fake:
//!
//! - [`StoreConnector`] performs the handshake and hands out a connection
//! - [`StoreConnection`] is a shared, multiplexed handle exposing the primitive
//!   commands the cache and lock layers need
//!
//! [`ConnectionManager`] owns the single live handle, rebuilds it under an async mutex
//! when it stops reporting connected, and publishes [`ConnectionEvent`]s.

pub mod events;
pub mod manager;
pub mod redis_store;

pub use events::ConnectionEvent;
pub use manager::ConnectionManager;
pub use redis_store::{RedisConnector, RedisStoreConnection};

use crate::error::CacheResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Handshake parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Database selected by default on the new handle
    pub database: i64,
    pub connect_timeout: Duration,
    /// Handshake attempts before giving up
    pub connect_retry: u32,
    /// Idle period after which the manager pings before handing the handle out
    pub keep_alive: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            database: 0,
            connect_timeout: Duration::from_secs(5),
            connect_retry: 3,
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// One page of a cursor-based key scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; `0` means the scan is complete
    pub cursor: u64,
    pub keys: Vec<String>,
}

/// Primitive store commands over a live connection
///
/// Every method takes the logical database index. Implementations must be safe to call
/// from many tasks at once.
#[async_trait]
pub trait StoreConnection: Send + Sync + std::fmt::Debug {
    /// Liveness as last observed; flips to false on a connectivity failure
    fn is_connected(&self) -> bool;

    async fn get(&self, db: i64, key: &str) -> CacheResult<Option<Vec<u8>>>;

    async fn set(&self, db: i64, key: &str, value: &[u8], ttl: Option<Duration>)
        -> CacheResult<()>;

    /// Pipelined writes; not atomic as a unit
    async fn set_many(
        &self,
        db: i64,
        entries: &[(String, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<()>;

    /// Returns the number of keys actually removed
    async fn delete(&self, db: i64, keys: &[String]) -> CacheResult<u64>;

    async fn exists(&self, db: i64, key: &str) -> CacheResult<bool>;

    /// Remaining TTL; `None` when the key is missing or has no expiry
    async fn ttl(&self, db: i64, key: &str) -> CacheResult<Option<Duration>>;

    /// Value and remaining TTL read in one round trip
    async fn get_with_ttl(
        &self,
        db: i64,
        key: &str,
    ) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>>;

    async fn scan(&self, db: i64, cursor: u64, pattern: &str, count: usize)
        -> CacheResult<ScanPage>;

    /// `SET key value NX PX ttl`; true when the key was created
    async fn set_if_absent(&self, db: i64, key: &str, value: &[u8], ttl: Duration)
        -> CacheResult<bool>;

    /// Delete `key` only while it still holds `expected`
    async fn delete_if_equals(&self, db: i64, key: &str, expected: &[u8]) -> CacheResult<bool>;

    /// Reset the expiry of `key` only while it still holds `expected`
    async fn expire_if_equals(
        &self,
        db: i64,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> CacheResult<bool>;

    async fn ping(&self, db: i64) -> CacheResult<()>;

    /// Dispose of the handle; later calls fail with a connectivity error
    async fn close(&self);
}

/// Establishes connections to a configured endpoint
#[async_trait]
pub trait StoreConnector: Send + Sync + std::fmt::Debug {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> CacheResult<Arc<dyn StoreConnection>>;
}
