//! # Resilient Cache Client
//!
//! Public facade over the [`OperationExecutor`]. Every operation takes a [`Tolerance`]:
//! `Strict` surfaces errors, `Lenient` logs them and returns the type's default, so
//! under a sustained outage reads come back empty and writes report `false`.

use super::executor::{validate_key, OperationExecutor};
use super::health::HealthStatus;
use super::purge::{BatchDeleter, PurgeOutcome};
use super::scan::KeyScanner;
use crate::codec;
use crate::config::ScanConfig;
use crate::error::{CacheError, CacheResult, Tolerance};
use crate::resilience::CircuitState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// A stored value with its remaining time to live
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// `None` when the key never expires
    pub ttl: Option<Duration>,
}

/// Escape glob metacharacters so `text` matches literally in a SCAN pattern
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Cache operations against one logical database
#[derive(Debug, Clone)]
pub struct ResilientCache {
    executor: Arc<OperationExecutor>,
    database: i64,
    scan: ScanConfig,
    health_check_key: Arc<str>,
}

impl ResilientCache {
    pub fn new(
        executor: Arc<OperationExecutor>,
        database: i64,
        scan: ScanConfig,
        health_check_key: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            database,
            scan,
            health_check_key: Arc::from(health_check_key.into()),
        }
    }

    /// Same cache, different logical database; the index is passed through unchecked
    pub fn on_database(&self, database: i64) -> Self {
        Self {
            database,
            ..self.clone()
        }
    }

    pub fn database(&self) -> i64 {
        self.database
    }

    /// Raw bytes stored at `key`
    pub async fn get_bytes(&self, key: &str, tolerance: Tolerance) -> CacheResult<Option<Vec<u8>>> {
        let db = self.database;
        self.executor
            .execute("get", key, tolerance, |conn| async move {
                conn.get(db, key).await
            })
            .await
    }

    /// UTF-8 string stored at `key`
    pub async fn get(&self, key: &str, tolerance: Tolerance) -> CacheResult<Option<String>> {
        let bytes = self.get_bytes(key, tolerance).await?;
        let result = bytes
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|e| {
                    CacheError::Serialization(format!("value is not valid UTF-8: {}", e))
                })
            })
            .transpose();
        tolerance.resolve(result, "get", key)
    }

    /// Store raw bytes; `true` when the write reached the store
    pub async fn set_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        tolerance: Tolerance,
    ) -> CacheResult<bool> {
        let db = self.database;
        self.executor
            .execute("set", key, tolerance, |conn| async move {
                conn.set(db, key, value, ttl).await.map(|()| true)
            })
            .await
    }

    /// Store a string
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        tolerance: Tolerance,
    ) -> CacheResult<bool> {
        self.set_bytes(key, value.as_bytes(), ttl, tolerance).await
    }

    /// Remove `key`; `true` when it existed
    pub async fn delete(&self, key: &str, tolerance: Tolerance) -> CacheResult<bool> {
        let db = self.database;
        let keys = [key.to_string()];
        self.executor
            .execute("delete", key, tolerance, |conn| async move {
                conn.delete(db, &keys).await.map(|removed| removed > 0)
            })
            .await
    }

    /// Remove several keys in one round trip; returns how many existed
    pub async fn delete_many(&self, keys: &[String], tolerance: Tolerance) -> CacheResult<u64> {
        let label = keys.first().map(String::as_str).unwrap_or("");
        if keys.is_empty() {
            return Ok(0);
        }

        let validated = keys.iter().try_for_each(|key| validate_key(key));
        if let Err(e) = validated {
            return tolerance.resolve(Err(e), "delete_many", label);
        }

        let db = self.database;
        let result = self
            .executor
            .run("delete_many", Some(label), |conn| async move {
                conn.delete(db, keys).await
            })
            .await;
        tolerance.resolve(result, "delete_many", label)
    }

    pub async fn exists(&self, key: &str, tolerance: Tolerance) -> CacheResult<bool> {
        let db = self.database;
        self.executor
            .execute("exists", key, tolerance, |conn| async move {
                conn.exists(db, key).await
            })
            .await
    }

    /// Pipelined write of many entries sharing one TTL; not atomic as a unit
    pub async fn set_many<I, K, V>(
        &self,
        entries: I,
        ttl: Option<Duration>,
        tolerance: Tolerance,
    ) -> CacheResult<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        let entries: Vec<(String, Vec<u8>)> = entries
            .into_iter()
            .map(|(key, value)| (key.into(), value.as_ref().to_vec()))
            .collect();

        let label = entries.first().map(|(k, _)| k.clone()).unwrap_or_default();
        if entries.is_empty() {
            return Ok(true);
        }

        if let Err(e) = entries.iter().try_for_each(|(key, _)| validate_key(key)) {
            return tolerance.resolve(Err(e), "set_many", &label);
        }

        let db = self.database;
        let result = self
            .executor
            .run("set_many", Some(label.as_str()), |conn| async move {
                conn.set_many(db, &entries, ttl).await.map(|()| true)
            })
            .await;
        tolerance.resolve(result, "set_many", &label)
    }

    /// Encode `value` and store it
    pub async fn set_serialized<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tolerance: Tolerance,
    ) -> CacheResult<bool> {
        let bytes = match codec::encode(value) {
            Ok(bytes) => bytes,
            Err(e) => return tolerance.resolve(Err(e), "set_serialized", key),
        };
        self.set_bytes(key, &bytes, ttl, tolerance).await
    }

    /// Load and decode the value stored at `key`
    pub async fn get_deserialized<T: DeserializeOwned>(
        &self,
        key: &str,
        tolerance: Tolerance,
    ) -> CacheResult<Option<T>> {
        let bytes = self.get_bytes(key, tolerance).await?;
        let result = bytes.map(|bytes| codec::decode(&bytes)).transpose();
        tolerance.resolve(result, "get_deserialized", key)
    }

    /// Value and remaining TTL in one round trip
    pub async fn get_with_ttl(
        &self,
        key: &str,
        tolerance: Tolerance,
    ) -> CacheResult<Option<CacheEntry>> {
        let db = self.database;
        self.executor
            .execute("get_with_ttl", key, tolerance, |conn| async move {
                let entry = conn.get_with_ttl(db, key).await?;
                Ok(entry.map(|(value, ttl)| CacheEntry {
                    key: key.to_string(),
                    value,
                    ttl,
                }))
            })
            .await
    }

    /// Remaining TTL; `None` when missing or persistent
    pub async fn ttl(&self, key: &str, tolerance: Tolerance) -> CacheResult<Option<Duration>> {
        let db = self.database;
        self.executor
            .execute("ttl", key, tolerance, |conn| async move {
                conn.ttl(db, key).await
            })
            .await
    }

    /// Lazy scan over keys matching a glob pattern
    pub fn scan(&self, pattern: &str) -> KeyScanner {
        KeyScanner::new(
            Arc::clone(&self.executor),
            self.database,
            pattern,
            self.scan.page_size,
        )
    }

    /// Delete every key matching `pattern`, optionally keeping only exact-prefix matches
    pub async fn purge(&self, pattern: &str, prefix_filter: Option<&str>) -> PurgeOutcome {
        let mut scanner = self.scan(pattern);
        if let Some(prefix) = prefix_filter {
            scanner = scanner.with_prefix_filter(prefix);
        }

        let mut deleter = BatchDeleter::new(
            Arc::clone(&self.executor),
            self.database,
            self.scan.delete_batch_size,
        );
        while let Some(key) = scanner.next_key().await {
            deleter.push(key).await;
        }

        let mut outcome = deleter.finish().await;
        outcome.complete &= scanner.is_complete();

        info!(
            pattern = pattern,
            deleted = outcome.deleted,
            batches = outcome.batches,
            pages = scanner.pages_fetched(),
            complete = outcome.complete,
            "Cache pattern DEL"
        );
        outcome
    }

    /// Delete every key matching `pattern`; returns the number removed
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        self.purge(pattern, None).await.deleted
    }

    /// Delete every key starting with `prefix`
    ///
    /// The server is asked for substring matches and the exact prefix is enforced
    /// client-side.
    pub async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        if prefix.is_empty() {
            return 0;
        }
        let pattern = format!("*{}*", escape_glob(prefix));
        self.purge(&pattern, Some(prefix)).await.deleted
    }

    /// Trivial round trip through the breaker
    pub async fn health_check(&self) -> HealthStatus {
        let db = self.database;
        let key = Arc::clone(&self.health_check_key);
        let result = self
            .executor
            .run("health_check", Some(&*self.health_check_key), |conn| async move {
                conn.exists(db, &key).await
            })
            .await;
        HealthStatus::from_result(&result)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.executor.circuit_state()
    }

    pub fn operations_completed(&self) -> u64 {
        self.executor.operations_completed()
    }

    pub fn executor(&self) -> &Arc<OperationExecutor> {
        &self.executor
    }
}
