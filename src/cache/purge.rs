//! # Batched Deleter
//!
//! Accumulates keys into a bounded buffer and issues one multi-key delete each time it
//! fills, flushing the remainder on [`BatchDeleter::finish`]. A failed batch is logged
//! and skipped; the outcome reports how much was removed and whether anything failed.

use super::executor::OperationExecutor;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Totals of a bulk delete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeOutcome {
    /// Keys the store reported as removed
    pub deleted: u64,
    /// Delete round trips issued
    pub batches: u64,
    /// False when a batch or the underlying scan failed
    pub complete: bool,
}

#[derive(Debug)]
pub struct BatchDeleter {
    executor: Arc<OperationExecutor>,
    database: i64,
    batch_size: usize,
    buffer: Vec<String>,
    outcome: PurgeOutcome,
}

impl BatchDeleter {
    pub fn new(executor: Arc<OperationExecutor>, database: i64, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            executor,
            database,
            batch_size,
            buffer: Vec::with_capacity(batch_size),
            outcome: PurgeOutcome {
                complete: true,
                ..PurgeOutcome::default()
            },
        }
    }

    /// Queue a key, deleting a full batch when the buffer reaches capacity
    pub async fn push(&mut self, key: String) {
        self.buffer.push(key);
        if self.buffer.len() >= self.batch_size {
            self.flush().await;
        }
    }

    /// Delete whatever is buffered
    pub async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let keys = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
        let batch_len = keys.len();
        let database = self.database;
        self.outcome.batches += 1;

        let result = self
            .executor
            .run("delete_batch", None, move |conn| async move {
                conn.delete(database, &keys).await
            })
            .await;

        match result {
            Ok(removed) => {
                self.outcome.deleted += removed;
                debug!(batch_len = batch_len, removed = removed, "Deleted key batch");
            }
            Err(error) => {
                self.outcome.complete = false;
                warn!(
                    batch_len = batch_len,
                    error_kind = error.label(),
                    error = %error,
                    "Key batch delete failed, continuing"
                );
            }
        }
    }

    /// Flush the remainder and report totals
    pub async fn finish(mut self) -> PurgeOutcome {
        self.flush().await;
        self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectOptions, ConnectionManager};
    use crate::resilience::{CircuitBreaker, CircuitBreakerConfig};
    use crate::test_utils::{FakeConnector, FakeStore};
    use std::time::Duration;

    fn executor(store: &FakeStore) -> Arc<OperationExecutor> {
        let connections = Arc::new(ConnectionManager::new(
            "cache",
            Some("redis://fake".to_string()),
            ConnectOptions::default(),
            Arc::new(FakeConnector::new(store.clone())),
        ));
        Arc::new(OperationExecutor::new(
            connections,
            Arc::new(CircuitBreaker::new(
                "cache".to_string(),
                CircuitBreakerConfig::default(),
            )),
            Duration::from_millis(500),
        ))
    }

    #[tokio::test]
    async fn test_batches_are_bounded() {
        let store = FakeStore::new();
        for i in 0..25 {
            store.insert(0, &format!("k:{}", i), b"v", None);
        }

        let mut deleter = BatchDeleter::new(executor(&store), 0, 10);
        for i in 0..25 {
            deleter.push(format!("k:{}", i)).await;
        }
        assert_eq!(store.calls("DEL"), 2);

        let outcome = deleter.finish().await;
        assert_eq!(outcome.deleted, 25);
        assert_eq!(outcome.batches, 3);
        assert!(outcome.complete);
        assert_eq!(store.calls("DEL"), 3);
        assert!(store.is_empty(0));
    }

    #[tokio::test]
    async fn test_finish_without_keys_issues_nothing() {
        let store = FakeStore::new();
        let outcome = BatchDeleter::new(executor(&store), 0, 10).finish().await;
        assert_eq!(outcome.batches, 0);
        assert!(outcome.complete);
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_reported_not_raised() {
        let store = FakeStore::new();
        store.insert(0, "a", b"v", None);
        let mut deleter = BatchDeleter::new(executor(&store), 0, 1);

        store.fail_next(crate::error::CacheError::Backend("READONLY".to_string()));
        deleter.push("a".to_string()).await;
        let outcome = deleter.finish().await;

        assert_eq!(outcome.deleted, 0);
        assert_eq!(outcome.batches, 1);
        assert!(!outcome.complete);
    }
}
