//! # Key-Space Scanner
//!
//! Cursor-based, memory-bounded enumeration of keys matching a glob pattern. Holds at
//! most one page of keys at a time. Every page fetch goes through the executor, so an
//! open circuit or a mid-scan outage ends the sequence early; partial results are
//! expected and [`KeyScanner::was_interrupted`] tells the two endings apart.
//!
//! A scanner is finite and not restartable: once it returns `None` it stays done.

use super::executor::OperationExecutor;
use futures::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Active,
    Exhausted,
    Interrupted,
}

/// Lazy iterator over matching keys
#[derive(Debug)]
pub struct KeyScanner {
    executor: Arc<OperationExecutor>,
    database: i64,
    pattern: String,
    prefix: Option<String>,
    page_size: usize,
    cursor: u64,
    buffer: VecDeque<String>,
    state: ScanState,
    pages: u64,
}

impl KeyScanner {
    pub fn new(
        executor: Arc<OperationExecutor>,
        database: i64,
        pattern: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            executor,
            database,
            pattern: pattern.into(),
            prefix: None,
            page_size: page_size.max(1),
            cursor: 0,
            buffer: VecDeque::new(),
            state: ScanState::Active,
            pages: 0,
        }
    }

    /// Keep only keys that start with `prefix` exactly
    pub fn with_prefix_filter(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Next matching key, fetching another page when the buffer runs dry
    pub async fn next_key(&mut self) -> Option<String> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(key);
            }

            if self.state != ScanState::Active {
                return None;
            }

            self.fetch_page().await;
        }
    }

    async fn fetch_page(&mut self) {
        let (database, cursor, count) = (self.database, self.cursor, self.page_size);
        let pattern = self.pattern.clone();

        let page = self
            .executor
            .run("scan", None, move |conn| async move {
                conn.scan(database, cursor, &pattern, count).await
            })
            .await;

        match page {
            Ok(page) => {
                self.pages += 1;
                self.cursor = page.cursor;
                let prefix = self.prefix.as_deref();
                self.buffer.extend(
                    page.keys
                        .into_iter()
                        .filter(|key| prefix.map_or(true, |p| key.starts_with(p))),
                );
                if page.cursor == 0 {
                    self.state = ScanState::Exhausted;
                }
            }
            Err(error) => {
                debug!(
                    pattern = %self.pattern,
                    pages = self.pages,
                    error_kind = error.label(),
                    "Key scan ended early"
                );
                self.state = ScanState::Interrupted;
            }
        }
    }

    /// True once the server reported the end of the key space
    pub fn is_complete(&self) -> bool {
        self.state == ScanState::Exhausted
    }

    /// True when a page fetch failed before the end of the key space
    pub fn was_interrupted(&self) -> bool {
        self.state == ScanState::Interrupted
    }

    /// Pages fetched so far
    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }

    /// Adapt into a `futures::Stream` of keys
    pub fn into_stream(self) -> impl Stream<Item = String> {
        stream::unfold(self, |mut scanner| async move {
            scanner.next_key().await.map(|key| (key, scanner))
        })
    }

    /// Drain every remaining key into memory
    pub async fn collect_keys(mut self) -> Vec<String> {
        let mut keys = Vec::new();
        while let Some(key) = self.next_key().await {
            keys.push(key);
        }
        keys
    }
}
