//! # Test Utilities
//!
//! In-memory stand-ins for a Redis-protocol store, used by unit and integration tests.
//!
//! [`FakeStore`] keeps per-database ordered maps with lazy TTL expiry, hands out stable
//! SCAN cursors, and counts every command attempt (including ones made while offline)
//! so tests can assert that an open circuit never touched the network. Flip it offline
//! with [`FakeStore::set_online`] or slow it down with [`FakeStore::set_latency`].

use crate::connection::{ConnectOptions, ScanPage, StoreConnection, StoreConnector};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

type Database = BTreeMap<String, Entry>;

#[derive(Debug, Default)]
struct FakeStoreState {
    databases: HashMap<i64, Database>,
    /// cursor id -> (database, last key returned)
    cursors: HashMap<u64, (i64, String)>,
    next_cursor: u64,
    pending_error: Option<CacheError>,
}

#[derive(Debug)]
struct FakeStoreInner {
    state: Mutex<FakeStoreState>,
    online: AtomicBool,
    latency_micros: AtomicU64,
    calls: Mutex<HashMap<&'static str, u64>>,
}

/// Shared in-memory store; clones observe the same data
#[derive(Debug, Clone)]
pub struct FakeStore {
    inner: Arc<FakeStoreInner>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeStoreInner {
                state: Mutex::new(FakeStoreState {
                    next_cursor: 1,
                    ..FakeStoreState::default()
                }),
                online: AtomicBool::new(true),
                latency_micros: AtomicU64::new(0),
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Delay applied to every command before it is answered
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_micros
            .store(latency.as_micros() as u64, Ordering::SeqCst);
    }

    fn latency(&self) -> Duration {
        Duration::from_micros(self.inner.latency_micros.load(Ordering::SeqCst))
    }

    /// Make the next command fail with `error` (without affecting connectivity)
    pub fn fail_next(&self, error: CacheError) {
        self.inner.state.lock().pending_error = Some(error);
    }

    /// Attempts of one command, e.g. `"GET"`, `"SCAN"`, `"DEL"`
    pub fn calls(&self, command: &str) -> u64 {
        self.inner.calls.lock().get(command).copied().unwrap_or(0)
    }

    /// Attempts of every command
    pub fn total_calls(&self) -> u64 {
        self.inner.calls.lock().values().sum()
    }

    pub fn reset_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Seed a value directly, bypassing connections and counters
    pub fn insert(&self, db: i64, key: &str, value: &[u8], ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.inner.state.lock().databases.entry(db).or_default().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
    }

    /// Live value of a key, bypassing connections and counters
    pub fn value(&self, db: i64, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .databases
            .get(&db)
            .and_then(|d| d.get(key))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Number of live keys in a database
    pub fn len(&self, db: i64) -> usize {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .databases
            .get(&db)
            .map(|d| d.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, db: i64) -> bool {
        self.len(db) == 0
    }

    fn record(&self, command: &'static str) {
        *self.inner.calls.lock().entry(command).or_insert(0) += 1;
    }
}

/// Redis-style glob match supporting `*`, `?`, and backslash escapes
pub fn glob_match(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[char], key: &[char]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some(('*', rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some(('?', rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some(('\\', rest)) if !rest.is_empty() => {
                key.first() == Some(&rest[0]) && matches(&rest[1..], &key[1..])
            }
            Some((c, rest)) => key.first() == Some(c) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();
    matches(&pattern, &key)
}

/// Connection bound to a [`FakeStore`]
#[derive(Debug)]
pub struct FakeConnection {
    store: FakeStore,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn new(store: FakeStore) -> Self {
        Self {
            store,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    async fn command<T>(
        &self,
        name: &'static str,
        op: impl FnOnce(&mut FakeStoreState, Instant) -> T + Send,
    ) -> CacheResult<T> {
        self.store.record(name);

        let latency = self.store.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(CacheError::Connectivity("connection closed".to_string()));
        }

        if !self.store.is_online() {
            self.connected.store(false, Ordering::SeqCst);
            return Err(CacheError::Connectivity(format!(
                "{} failed: connection reset by peer",
                name
            )));
        }

        let mut state = self.store.inner.state.lock();
        if let Some(error) = state.pending_error.take() {
            if error.trips_breaker() {
                self.connected.store(false, Ordering::SeqCst);
            }
            return Err(error);
        }

        Ok(op(&mut state, Instant::now()))
    }
}

fn live<'a>(state: &'a mut FakeStoreState, db: i64, key: &str, now: Instant) -> Option<&'a Entry> {
    let database = state.databases.entry(db).or_default();
    if database.get(key).is_some_and(|entry| entry.is_expired(now)) {
        database.remove(key);
    }
    database.get(key)
}

#[async_trait]
impl StoreConnection for FakeConnection {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn get(&self, db: i64, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.command("GET", |state, now| {
            live(state, db, key, now).map(|entry| entry.value.clone())
        })
        .await
    }

    async fn set(
        &self,
        db: i64,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.command("SET", |state, now| {
            state.databases.entry(db).or_default().insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        })
        .await
    }

    async fn set_many(
        &self,
        db: i64,
        entries: &[(String, Vec<u8>)],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.command("MSET", |state, now| {
            let database = state.databases.entry(db).or_default();
            for (key, value) in entries {
                database.insert(
                    key.clone(),
                    Entry {
                        value: value.clone(),
                        expires_at: ttl.map(|ttl| now + ttl),
                    },
                );
            }
        })
        .await
    }

    async fn delete(&self, db: i64, keys: &[String]) -> CacheResult<u64> {
        self.command("DEL", |state, now| {
            let database = state.databases.entry(db).or_default();
            keys.iter()
                .filter_map(|key| database.remove(key))
                .filter(|entry| !entry.is_expired(now))
                .count() as u64
        })
        .await
    }

    async fn exists(&self, db: i64, key: &str) -> CacheResult<bool> {
        self.command("EXISTS", |state, now| live(state, db, key, now).is_some())
            .await
    }

    async fn ttl(&self, db: i64, key: &str) -> CacheResult<Option<Duration>> {
        self.command("PTTL", |state, now| {
            live(state, db, key, now).and_then(|entry| entry.remaining(now))
        })
        .await
    }

    async fn get_with_ttl(
        &self,
        db: i64,
        key: &str,
    ) -> CacheResult<Option<(Vec<u8>, Option<Duration>)>> {
        self.command("GET+PTTL", |state, now| {
            live(state, db, key, now).map(|entry| (entry.value.clone(), entry.remaining(now)))
        })
        .await
    }

    async fn scan(
        &self,
        db: i64,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> CacheResult<ScanPage> {
        self.command("SCAN", |state, now| {
            let start = match cursor {
                0 => Bound::Unbounded,
                id => match state.cursors.remove(&id) {
                    Some((cursor_db, last)) if cursor_db == db => Bound::Excluded(last),
                    // Unknown cursor ends the iteration, as a server restart would
                    _ => return ScanPage::default(),
                },
            };

            let database = state.databases.entry(db).or_default();
            // COUNT bounds the keys examined, not the keys returned
            let examined: Vec<(String, bool)> = database
                .range((start, Bound::Unbounded))
                .take(count.max(1))
                .map(|(key, entry)| (key.clone(), !entry.is_expired(now)))
                .collect();

            let exhausted = examined.len() < count.max(1)
                || examined.last().is_some_and(|(last, _)| {
                    database
                        .range::<String, _>((Bound::Excluded(last.clone()), Bound::Unbounded))
                        .next()
                        .is_none()
                });

            let keys = examined
                .iter()
                .filter(|(key, alive)| *alive && glob_match(pattern, key))
                .map(|(key, _)| key.clone())
                .collect();

            let next = match (exhausted, examined.last()) {
                (false, Some((last, _))) => {
                    let id = state.next_cursor;
                    state.next_cursor += 1;
                    state.cursors.insert(id, (db, last.clone()));
                    id
                }
                _ => 0,
            };

            ScanPage { cursor: next, keys }
        })
        .await
    }

    async fn set_if_absent(
        &self,
        db: i64,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> CacheResult<bool> {
        self.command("SET NX", |state, now| {
            if live(state, db, key, now).is_some() {
                return false;
            }
            state.databases.entry(db).or_default().insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: Some(now + ttl),
                },
            );
            true
        })
        .await
    }

    async fn delete_if_equals(&self, db: i64, key: &str, expected: &[u8]) -> CacheResult<bool> {
        self.command("EVAL compare-and-delete", |state, now| {
            let holds = live(state, db, key, now).is_some_and(|entry| entry.value == expected);
            if holds {
                state.databases.entry(db).or_default().remove(key);
            }
            holds
        })
        .await
    }

    async fn expire_if_equals(
        &self,
        db: i64,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> CacheResult<bool> {
        self.command("EVAL compare-and-pexpire", |state, now| {
            let holds = live(state, db, key, now).is_some_and(|entry| entry.value == expected);
            if holds {
                if let Some(entry) = state.databases.entry(db).or_default().get_mut(key) {
                    entry.expires_at = Some(now + ttl);
                }
            }
            holds
        })
        .await
    }

    async fn ping(&self, _db: i64) -> CacheResult<()> {
        self.command("PING", |_, _| ()).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Connector handing out [`FakeConnection`]s
#[derive(Debug)]
pub struct FakeConnector {
    default_store: FakeStore,
    cluster: HashMap<String, FakeStore>,
    connect_attempts: AtomicU64,
    handshake_delay_micros: AtomicU64,
    handshake_error: Mutex<Option<CacheError>>,
}

impl FakeConnector {
    /// Every endpoint resolves to `store`
    pub fn new(store: FakeStore) -> Self {
        Self {
            default_store: store,
            cluster: HashMap::new(),
            connect_attempts: AtomicU64::new(0),
            handshake_delay_micros: AtomicU64::new(0),
            handshake_error: Mutex::new(None),
        }
    }

    /// Independent stores per endpoint, for quorum tests
    pub fn cluster<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (S, FakeStore)>,
        S: Into<String>,
    {
        let cluster: HashMap<String, FakeStore> = nodes
            .into_iter()
            .map(|(endpoint, store)| (endpoint.into(), store))
            .collect();
        Self {
            default_store: FakeStore::new(),
            cluster,
            connect_attempts: AtomicU64::new(0),
            handshake_delay_micros: AtomicU64::new(0),
            handshake_error: Mutex::new(None),
        }
    }

    /// Slow down every handshake
    pub fn set_handshake_delay(&self, delay: Duration) {
        self.handshake_delay_micros
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Fail every handshake with `error` until cleared
    pub fn set_handshake_error(&self, error: Option<CacheError>) {
        *self.handshake_error.lock() = error;
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    fn store_for(&self, endpoint: &str) -> FakeStore {
        self.cluster
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| self.default_store.clone())
    }
}

#[async_trait]
impl StoreConnector for FakeConnector {
    async fn connect(
        &self,
        endpoint: &str,
        _options: &ConnectOptions,
    ) -> CacheResult<Arc<dyn StoreConnection>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let delay = Duration::from_micros(self.handshake_delay_micros.load(Ordering::SeqCst));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.handshake_error.lock().clone() {
            return Err(error);
        }

        let store = self.store_for(endpoint);
        if !store.is_online() {
            return Err(CacheError::Connectivity(format!(
                "connection refused: {}",
                endpoint
            )));
        }

        Ok(Arc::new(FakeConnection::new(store)))
    }
}
