//! # Error Taxonomy
//!
//! Every remote operation resolves to a tagged `CacheResult<T>`. The variant decides
//! whether the failure counts against the circuit breaker:
//!
//! - `Connectivity` / `Timeout` trip the breaker (the store is unreachable or slow)
//! - everything else is local or application-level and leaves the breaker alone
//!
//! Callers pick a [`Tolerance`] at the API boundary. `Strict` hands the error back,
//! `Lenient` logs it and substitutes the type's default (`None`, `false`, `0`).

use crate::resilience::FailureKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors produced by cache, connection, and lock operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// No store address configured, or the connection was shut down; a permanent no-op
    #[error("Store configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Handshake or mid-operation network failure
    #[error("Store connectivity failure: {0}")]
    Connectivity(String),

    /// Operation exceeded its deadline
    #[error("Store operation timed out: {0}")]
    Timeout(String),

    /// Rejected without a network attempt because the breaker is open
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Malformed input rejected before any network attempt
    #[error("Validation failure: {0}")]
    Validation(String),

    /// Payload could not be encoded or decoded
    #[error("Serialization failure: {0}")]
    Serialization(String),

    /// The store answered with an error reply (wrong type, script error, ...)
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl CacheError {
    /// Breaker classification of this error
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            CacheError::Connectivity(_) => FailureKind::Connectivity,
            CacheError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Application,
        }
    }

    /// True for failures that indicate an outage rather than a bug
    pub fn trips_breaker(&self) -> bool {
        self.failure_kind().trips_breaker()
    }

    /// Short stable label used in structured log fields
    pub fn label(&self) -> &'static str {
        match self {
            CacheError::ConfigurationMissing(_) => "configuration_missing",
            CacheError::Connectivity(_) => "connectivity",
            CacheError::Timeout(_) => "timeout",
            CacheError::CircuitOpen { .. } => "circuit_open",
            CacheError::Validation(_) => "validation",
            CacheError::Serialization(_) => "serialization",
            CacheError::Backend(_) => "backend",
        }
    }
}

/// Result type for cache, connection, and lock operations
pub type CacheResult<T> = Result<T, CacheError>;

/// How a caller wants failures surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tolerance {
    /// Propagate every error to the caller
    Strict,
    /// Log and return the default value
    #[default]
    Lenient,
}

impl Tolerance {
    /// Apply this tolerance to an operation result
    ///
    /// Breaker-tripping errors and circuit-open rejections are only logged at debug
    /// level here; the breaker already logs once per transition.
    pub fn resolve<T: Default>(
        self,
        result: CacheResult<T>,
        operation: &str,
        key: &str,
    ) -> CacheResult<T> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if self == Tolerance::Strict {
            return Err(err);
        }

        match &err {
            CacheError::Connectivity(_)
            | CacheError::Timeout(_)
            | CacheError::CircuitOpen { .. }
            | CacheError::ConfigurationMissing(_) => {
                debug!(
                    operation = operation,
                    key = key,
                    error_kind = err.label(),
                    "Lenient cache call degraded to default"
                );
            }
            CacheError::Validation(_) => {
                warn!(
                    operation = operation,
                    key = key,
                    error = %err,
                    "Rejected invalid cache request"
                );
            }
            CacheError::Serialization(_) | CacheError::Backend(_) => {
                error!(
                    operation = operation,
                    key = key,
                    error = %err,
                    "Cache operation failed"
                );
            }
        }

        Ok(T::default())
    }

    /// Whether errors are propagated
    pub fn is_strict(self) -> bool {
        self == Tolerance::Strict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_outages_trip_breaker() {
        assert!(CacheError::Connectivity("refused".into()).trips_breaker());
        assert!(CacheError::Timeout("5s".into()).trips_breaker());
        assert!(!CacheError::Validation("empty key".into()).trips_breaker());
        assert!(!CacheError::Serialization("bad".into()).trips_breaker());
        assert!(!CacheError::Backend("WRONGTYPE".into()).trips_breaker());
        assert!(!CacheError::ConfigurationMissing("REDIS_URL".into()).trips_breaker());
        assert!(!CacheError::CircuitOpen {
            component: "cache".into()
        }
        .trips_breaker());
    }

    #[test]
    fn test_lenient_returns_default() {
        let result: CacheResult<Option<String>> =
            Err(CacheError::Connectivity("refused".into()));
        let resolved = Tolerance::Lenient.resolve(result, "get", "user:42");
        assert_eq!(resolved, Ok(None));

        let result: CacheResult<bool> = Err(CacheError::Backend("WRONGTYPE".into()));
        assert_eq!(Tolerance::Lenient.resolve(result, "set", "k"), Ok(false));
    }

    #[test]
    fn test_strict_propagates() {
        let result: CacheResult<u64> = Err(CacheError::CircuitOpen {
            component: "cache".into(),
        });
        let resolved = Tolerance::Strict.resolve(result, "delete", "k");
        assert!(matches!(resolved, Err(CacheError::CircuitOpen { .. })));
    }

    #[test]
    fn test_default_tolerance_is_lenient() {
        assert_eq!(Tolerance::default(), Tolerance::Lenient);
        assert!(!Tolerance::Lenient.is_strict());
        assert!(Tolerance::Strict.is_strict());
    }
}
