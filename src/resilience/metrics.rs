//! # Circuit Breaker Metrics
//!
//! Snapshot of breaker counters for health reports and operator tooling.

use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the network (success or failure)
    pub total_calls: u64,

    /// Number of successful calls
    pub success_count: u64,

    /// Number of failed calls, any kind
    pub failure_count: u64,

    /// Calls rejected without a network attempt
    pub rejected_count: u64,

    /// Number of Closed/HalfOpen -> Open transitions
    pub trip_count: u64,

    /// Current consecutive tripping-failure count
    pub consecutive_failures: u64,

    /// Total duration of all attempted calls
    pub total_duration: Duration,

    /// Current circuit breaker state
    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,
}

impl CircuitBreakerMetrics {
    /// Create new metrics instance with zero values
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            trip_count: 0,
            consecutive_failures: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
        }
    }

    /// Average duration of attempted calls
    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total_calls as u32
    }

    /// Get human-readable state description
    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Probe in flight",
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_duration() {
        let mut metrics = CircuitBreakerMetrics::new();
        assert_eq!(metrics.average_duration(), Duration::ZERO);

        metrics.total_calls = 4;
        metrics.total_duration = Duration::from_millis(100);
        assert_eq!(metrics.average_duration(), Duration::from_millis(25));
    }

    #[test]
    fn test_state_description() {
        let mut metrics = CircuitBreakerMetrics::new();
        assert_eq!(metrics.state_description(), "Healthy - Normal operation");
        metrics.current_state = CircuitState::Open;
        assert_eq!(metrics.state_description(), "Failing - Rejecting all calls");
    }
}
