//! # Circuit Breaker Implementation
//!
//! Fault isolation for remote store calls. The breaker is Closed during normal
//! operation and trips Open on connectivity or timeout failures. While Open every call
//! is rejected by an atomic deadline comparison, never a sleep. Once the cooldown has
//! elapsed exactly one caller wins the probe slot (HalfOpen); its outcome closes the
//! circuit or re-opens it with a fresh cooldown.
//!
//! Every admission hands back an [`Attempt`] and outcomes are reported with it. Only
//! the current trial call may move the breaker out of HalfOpen, and only calls
//! admitted in the current closed period count towards the threshold. Late outcomes
//! from earlier admissions are still counted in the metrics.
//!
//! ```text
//! Closed --(threshold tripping failures)--> Open
//! Open --(cooldown elapsed, one caller claims probe)--> HalfOpen
//! HalfOpen --(probe succeeds)--> Closed
//! HalfOpen --(probe fails)--> Open (cooldown restarts)
//! ```

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Admission ticket handed out by [`CircuitBreaker::should_attempt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    /// Admitted while closed, during the given closed period
    Regular { generation: u64 },
    /// The single half-open trial call, keyed by the timestamp it claimed
    Trial { claimed_at: u64 },
}

impl Attempt {
    pub fn is_trial(&self) -> bool {
        matches!(self, Attempt::Trial { .. })
    }
}

/// Lock-free atomic counters for circuit breaker metrics.
#[derive(Debug)]
struct AtomicCircuitBreakerMetrics {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    rejected_count: AtomicU64,
    trip_count: AtomicU64,
    consecutive_failures: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCircuitBreakerMetrics {
    fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            trip_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_success(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.success_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn record_failure(&self, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    fn increment_consecutive_failures(&self) -> u64 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    fn reset_consecutive_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self, state: CircuitState) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);

        let failure_rate = if total_calls > 0 {
            failure_count as f64 / total_calls as f64
        } else {
            0.0
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count,
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            trip_count: self.trip_count.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_duration: Duration::from_nanos(
                self.total_duration_nanos.load(Ordering::Relaxed),
            ),
            current_state: state,
            failure_rate,
        }
    }
}

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// A single probe call is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

/// Classification of a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network failure or unavailable connection
    Connectivity,
    /// Deadline exceeded
    Timeout,
    /// The store answered, but the request or payload was bad
    Application,
}

impl FailureKind {
    /// Only outages trip the breaker
    pub fn trips_breaker(self) -> bool {
        matches!(self, FailureKind::Connectivity | FailureKind::Timeout)
    }
}

/// Core circuit breaker implementation with atomic state management
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Current circuit state (atomic for thread safety)
    state: AtomicU8,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    /// Lock-free atomic metrics
    metrics: AtomicCircuitBreakerMetrics,

    /// Monotonic origin for the transition timestamp
    clock_origin: Instant,

    /// Nanos since `clock_origin` of the last trip or probe claim.
    /// Written before the state store (Release) so readers observing Open see it.
    last_transition_nanos: AtomicU64,

    /// Bumped on every close; regular attempts from older periods are stale
    generation: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: AtomicCircuitBreakerMetrics::new(),
            clock_origin: Instant::now(),
            last_transition_nanos: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// True while calls are being rejected or probed
    pub fn is_open(&self) -> bool {
        self.state() != CircuitState::Closed
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.clock_origin.elapsed().as_nanos() as u64
    }

    /// Pre-flight check performed before every remote call
    ///
    /// Closed: always admits a regular attempt. Open/HalfOpen: `None` until the
    /// cooldown has elapsed since the last trip or probe, then a trial for exactly one
    /// caller, which claims the slot by swapping the transition timestamp.
    pub fn should_attempt(&self) -> Option<Attempt> {
        if self.state() == CircuitState::Closed {
            return Some(Attempt::Regular {
                generation: self.generation.load(Ordering::Acquire),
            });
        }

        let last = self.last_transition_nanos.load(Ordering::Acquire);
        let now = self.now_nanos();
        let cooldown_nanos = self.config.cooldown.as_nanos() as u64;

        if now.saturating_sub(last) < cooldown_nanos {
            return None;
        }

        if self
            .last_transition_nanos
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller claimed the probe
            return None;
        }

        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);

        info!(
            component = %self.name,
            "Circuit breaker half-open (probing recovery)"
        );
        Some(Attempt::Trial { claimed_at: now })
    }

    /// Whether `attempt` may still move the breaker
    fn is_current(&self, attempt: Attempt) -> bool {
        match attempt {
            Attempt::Regular { generation } => {
                self.state() == CircuitState::Closed
                    && self.generation.load(Ordering::Acquire) == generation
            }
            Attempt::Trial { claimed_at } => {
                self.state() == CircuitState::HalfOpen
                    && self.last_transition_nanos.load(Ordering::Acquire) == claimed_at
            }
        }
    }

    /// Record a rejected call (no network attempt was made)
    pub fn record_rejection(&self) {
        self.metrics.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful call
    pub fn record_success(&self, attempt: Attempt, duration: Duration) {
        self.metrics.record_success(duration);

        if !self.is_current(attempt) {
            debug!(
                component = %self.name,
                state = ?self.state(),
                "Late success ignored for state tracking"
            );
            return;
        }

        match attempt {
            Attempt::Regular { .. } => self.metrics.reset_consecutive_failures(),
            Attempt::Trial { .. } => {
                self.close_from(CircuitState::HalfOpen);
            }
        }
    }

    /// Record a failed call
    ///
    /// Returns `true` when this failure tripped the breaker, so callers can log once
    /// per transition rather than once per call.
    pub fn record_failure(&self, attempt: Attempt, kind: FailureKind, duration: Duration) -> bool {
        self.metrics.record_failure(duration);

        if !kind.trips_breaker() {
            return false;
        }

        if !self.is_current(attempt) {
            debug!(
                component = %self.name,
                state = ?self.state(),
                failure_kind = ?kind,
                "Late failure ignored for state tracking"
            );
            return false;
        }

        match attempt {
            Attempt::Regular { .. } => {
                let failures = self.metrics.increment_consecutive_failures();
                if failures >= self.config.failure_threshold as u64 {
                    self.trip_from(CircuitState::Closed)
                } else {
                    false
                }
            }
            Attempt::Trial { .. } => self.trip_from(CircuitState::HalfOpen),
        }
    }

    /// Transition to open state (failing fast); only one caller wins the transition
    fn trip_from(&self, from: CircuitState) -> bool {
        self.last_transition_nanos
            .store(self.now_nanos(), Ordering::Release);

        if self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.metrics.trip_count.fetch_add(1, Ordering::Relaxed);

        if from == CircuitState::HalfOpen {
            warn!(
                component = %self.name,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker probe failed, staying open"
            );
        } else {
            error!(
                component = %self.name,
                consecutive_failures = self.metrics.consecutive_failures.load(Ordering::Relaxed),
                failure_threshold = self.config.failure_threshold,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit breaker opened (failing fast)"
            );
        }
        true
    }

    /// Transition to closed state (normal operation), starting a new closed period
    fn close_from(&self, from: CircuitState) -> bool {
        self.metrics.reset_consecutive_failures();
        self.generation.fetch_add(1, Ordering::AcqRel);

        if self
            .state
            .compare_exchange(
                from as u8,
                CircuitState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        info!(
            component = %self.name,
            total_calls = self.metrics.total_calls.load(Ordering::Relaxed),
            "Circuit breaker closed (recovered)"
        );
        true
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let current = self.state();
        if current != CircuitState::Open {
            self.trip_from(current);
        }
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        let current = self.state();
        if current == CircuitState::Closed {
            self.metrics.reset_consecutive_failures();
        } else {
            self.close_from(current);
        }
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.metrics.snapshot(self.state())
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured cooldown
    pub fn cooldown(&self) -> Duration {
        self.config.cooldown
    }
}
