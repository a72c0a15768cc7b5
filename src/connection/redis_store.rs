//! Redis-protocol store connection
//!
//! Wraps `redis::aio::MultiplexedConnection`. One multiplexed connection is opened per
//! logical database on first use, since `SELECT` on a shared multiplexed pipe would
//! race between tasks. TCP keep-alive comes from the `redis` crate's socket setup.
//!
//! Errors are classified in one place ([`classify`]); any connectivity or timeout
//! failure flips the handle to disconnected so the manager rebuilds it.

use super::{ConnectOptions, ScanPage, StoreConnection, StoreConnector};
use crate::config::redact_url;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{ConnectionInfo, ErrorKind, RedisError, Script};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Delete a key only while it holds the caller's token
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Reset a key's expiry only while it holds the caller's token
const COMPARE_AND_PEXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Connector for Redis-protocol endpoints (`redis://`, `rediss://`)
#[derive(Debug, Default, Clone)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> CacheResult<Arc<dyn StoreConnection>> {
        // A malformed address never heals by retrying
        let client = redis::Client::open(endpoint).map_err(|e| {
            CacheError::ConfigurationMissing(format!(
                "Invalid store address {}: {}",
                redact_url(endpoint),
                e
            ))
        })?;

        let connection = RedisStoreConnection::establish(
            client.get_connection_info().clone(),
            options,
        )
        .await?;

        debug!(url = %redact_url(endpoint), database = options.database, "Redis store connected");
        Ok(Arc::new(connection))
    }
}

/// Live handle to a Redis-protocol store
pub struct RedisStoreConnection {
    info: ConnectionInfo,
    connect_timeout: Duration,
    databases: DashMap<i64, MultiplexedConnection>,
    connected: AtomicBool,
    closed: AtomicBool,
    release_script: Script,
    extend_script: Script,
}

impl std::fmt::Debug for RedisStoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStoreConnection")
            .field("addr", &self.info.addr.to_string())
            .field("databases", &self.databases.len())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl RedisStoreConnection {
    /// Handshake with the default database of `options`
    pub async fn establish(info: ConnectionInfo, options: &ConnectOptions) -> CacheResult<Self> {
        let connection = Self {
            info,
            connect_timeout: options.connect_timeout,
            databases: DashMap::new(),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            release_script: Script::new(COMPARE_AND_DELETE),
            extend_script: Script::new(COMPARE_AND_PEXPIRE),
        };

        let mut conn = connection.open(options.database).await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| classify(&e, "PING"))?;
        connection.databases.insert(options.database, conn);

        Ok(connection)
    }

    async fn open(&self, db: i64) -> CacheResult<MultiplexedConnection> {
        let mut info = self.info.clone();
        info.redis.db = db;

        let client = redis::Client::open(info).map_err(|e| {
            CacheError::ConfigurationMissing(format!("Invalid connection info: {}", e))
        })?;

        match timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(classify(&e, "CONNECT")),
            Err(_) => Err(CacheError::Timeout(format!(
                "handshake exceeded {}ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn conn(&self, db: i64) -> CacheResult<MultiplexedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Connectivity("connection closed".to_string()));
        }

        if let Some(conn) = self.databases.get(&db).map(|entry| entry.value().clone()) {
            return Ok(conn);
        }

        let conn = self.open(db).await.inspect_err(|e| self.note(e))?;
        Ok(self.databases.entry(db).or_insert(conn).value().clone())
    }

    fn note(&self, error: &CacheError) {
        if error.trips_breaker() {
            self.connected.store(false, Ordering::Release);
        }
    }

    fn fail(&self, error: RedisError, operation: &str) -> CacheError {
        let mapped = classify(&error, operation);
        self.note(&mapped);
        mapped
    }
}

/// Map a driver error onto the cache error taxonomy
pub fn classify(error: &RedisError, operation: &str) -> CacheError {
    let message = format!("Redis {} failed: {}", operation, error);

    if error.is_timeout() {
        return CacheError::Timeout(message);
    }

    if error.is_connection_dropped() || error.is_connection_refusal() || error.is_io_error() {
        return CacheError::Connectivity(message);
    }

    match error.kind() {
        ErrorKind::IoError
        | ErrorKind::BusyLoadingError
        | ErrorKind::TryAgain
        | ErrorKind::ClusterDown
        | ErrorKind::MasterDown
        | ErrorKind::AuthenticationFailed => CacheError::Connectivity(message),
        _ => CacheError::Backend(message),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn remaining_ttl(pttl: i64) -> Option<Duration> {
    // -2: missing key, -1: no expiry
    (pttl >= 0).then(|| Duration::from_millis(pttl as u64))
}

#[async_trait]
impl StoreConnection for RedisStoreConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    async fn get(&self, db: i64, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.conn(db).await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "GET"))?;

        if value.is_some() {
            debug!(key = key, "Cache HIT");
        } else {
            debug!(key = key, "Cache MISS");
        }
        Ok(value)
    }

    async fn set(
        &self,
        db: i64,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let mut conn = self.conn(db).await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }

        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "SET"))?;
        Ok(())
    }

    async fn set_many(
        &self,
        db: i64,
        entries: &[(String, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn(db).await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            pipe.cmd("SET").arg(key).arg(value.as_slice());
            if let Some(ttl) = ttl {
                pipe.arg("PX").arg(ttl_millis(ttl));
            }
            pipe.ignore();
        }

        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "SET (pipeline)"))?;
        Ok(())
    }

    async fn delete(&self, db: i64, keys: &[String]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn(db).await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "DEL"))?;
        Ok(removed)
    }

    async fn exists(&self, db: i64, key: &str) -> CacheResult<bool> {
        let mut conn = self.conn(db).await?;
        let count: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "EXISTS"))?;
        Ok(count > 0)
    }

    async fn ttl(&self, db: i64, key: &str) -> CacheResult<Option<Duration>> {
        let mut conn = self.conn(db).await?;
        let pttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "PTTL"))?;
        Ok(remaining_ttl(pttl))
    }

    async fn get_with_ttl(
        &self,
        db: i64,
        key: &str,
    ) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        let mut conn = self.conn(db).await?;
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key)
            .cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "GET+PTTL"))?;

        Ok(value.map(|bytes| (bytes, remaining_ttl(pttl))))
    }

    async fn scan(
        &self,
        db: i64,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> CacheResult<ScanPage> {
        let mut conn = self.conn(db).await?;
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "SCAN"))?;

        Ok(ScanPage {
            cursor: next_cursor,
            keys,
        })
    }

    async fn set_if_absent(
        &self,
        db: i64,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> CacheResult<bool> {
        let mut conn = self.conn(db).await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "SET NX"))?;
        Ok(reply.is_some())
    }

    async fn delete_if_equals(&self, db: i64, key: &str, expected: &[u8]) -> CacheResult<bool> {
        let mut conn = self.conn(db).await?;
        let mut invocation = self.release_script.key(key);
        invocation.arg(expected);
        let removed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "EVALSHA compare-and-delete"))?;
        Ok(removed == 1)
    }

    async fn expire_if_equals(
        &self,
        db: i64,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> CacheResult<bool> {
        let mut conn = self.conn(db).await?;
        let mut invocation = self.extend_script.key(key);
        invocation.arg(expected).arg(ttl_millis(ttl));
        let updated: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "EVALSHA compare-and-pexpire"))?;
        Ok(updated == 1)
    }

    async fn ping(&self, db: i64) -> CacheResult<()> {
        let mut conn = self.conn(db).await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.fail(e, "PING"))?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        // Dropping the multiplexed handles ends their driver tasks
        self.databases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_classify_io_failures_as_connectivity() {
        let refused = RedisError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert!(matches!(
            classify(&refused, "GET"),
            CacheError::Connectivity(_)
        ));

        let reset = RedisError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(classify(&reset, "SET").trips_breaker());
    }

    #[test]
    fn test_classify_timeouts() {
        let timed_out = RedisError::from(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(matches!(classify(&timed_out, "GET"), CacheError::Timeout(_)));
    }

    #[test]
    fn test_classify_application_errors_as_backend() {
        let wrong_type = RedisError::from((ErrorKind::TypeError, "WRONGTYPE"));
        let mapped = classify(&wrong_type, "GET");
        assert!(matches!(mapped, CacheError::Backend(_)));
        assert!(!mapped.trips_breaker());
    }

    #[test]
    fn test_classify_loading_as_connectivity() {
        let loading = RedisError::from((ErrorKind::BusyLoadingError, "LOADING"));
        assert!(classify(&loading, "GET").trips_breaker());
    }

    #[tokio::test]
    async fn test_malformed_address_is_a_configuration_error() {
        let connector = RedisConnector::new();
        for endpoint in ["not a url", "http://cache.internal:6379"] {
            let outcome = connector.connect(endpoint, &ConnectOptions::default()).await;
            match outcome {
                Err(error) => {
                    assert!(matches!(error, CacheError::ConfigurationMissing(_)));
                    assert!(!error.trips_breaker());
                }
                Ok(_) => panic!("{endpoint} should not produce a connection"),
            }
        }
    }

    #[test]
    fn test_remaining_ttl() {
        assert_eq!(remaining_ttl(-2), None);
        assert_eq!(remaining_ttl(-1), None);
        assert_eq!(remaining_ttl(1500), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
    }

    // Integration tests require a running Redis instance (behind test-services feature)
    #[cfg(feature = "test-services")]
    mod integration {
        use super::*;
        use tracing::warn;

        async fn connect() -> Option<Arc<dyn StoreConnection>> {
            let url =
                std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
            match RedisConnector::new()
                .connect(&url, &ConnectOptions::default())
                .await
            {
                Ok(connection) => Some(connection),
                Err(e) => {
                    warn!("Skipping Redis test (not available): {}", e);
                    None
                }
            }
        }

        #[tokio::test]
        async fn test_redis_crud_and_ttl() {
            let Some(conn) = connect().await else { return };
            let key = format!("test:crud:{}", uuid::Uuid::new_v4());

            conn.set(0, &key, b"value", Some(Duration::from_secs(60)))
                .await
                .unwrap();
            let (value, ttl) = conn.get_with_ttl(0, &key).await.unwrap().unwrap();
            assert_eq!(value, b"value");
            assert!(ttl.unwrap() <= Duration::from_secs(60));

            assert_eq!(conn.delete(0, &[key.clone()]).await.unwrap(), 1);
            assert!(!conn.exists(0, &key).await.unwrap());
        }

        #[tokio::test]
        async fn test_redis_compare_and_delete() {
            let Some(conn) = connect().await else { return };
            let key = format!("test:lock:{}", uuid::Uuid::new_v4());

            assert!(conn
                .set_if_absent(15, &key, b"token-a", Duration::from_secs(5))
                .await
                .unwrap());
            assert!(!conn
                .set_if_absent(15, &key, b"token-b", Duration::from_secs(5))
                .await
                .unwrap());
            assert!(!conn.delete_if_equals(15, &key, b"token-b").await.unwrap());
            assert!(conn.delete_if_equals(15, &key, b"token-a").await.unwrap());
        }
    }
}
