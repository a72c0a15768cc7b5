//! # Resilience Module
//!
//! Fail-fast protection for every remote store call.
//!
//! ## Architecture
//!
//! - **Circuit Breaker**: trips open on connectivity or timeout failures, rejects calls
//!   without touching the network for a cooldown window, then admits a single probe
//! - **Metrics Collection**: lock-free counters for calls, failures, rejections, and trips
//! - **Configuration**: failure threshold and cooldown, validated at startup
//!
//! ## Usage
//!
//! ```rust
//! use resilient_cache::resilience::{CircuitBreaker, CircuitBreakerConfig, FailureKind};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new("cache".to_string(), CircuitBreakerConfig::default());
//!
//! if let Some(attempt) = breaker.should_attempt() {
//!     // ... perform the remote call, then report the outcome with its ticket
//!     breaker.record_failure(attempt, FailureKind::Connectivity, Duration::from_millis(12));
//! }
//! assert!(breaker.is_open());
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;

pub use circuit_breaker::{Attempt, CircuitBreaker, CircuitState, FailureKind};
pub use config::CircuitBreakerConfig;
pub use metrics::CircuitBreakerMetrics;
