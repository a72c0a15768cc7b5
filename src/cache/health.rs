//! Health-check classification

use crate::error::{CacheError, CacheResult};
use crate::identity::ContainerIdentity;
use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};

/// Outcome of a trivial round trip against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Round trip succeeded
    Healthy,
    /// Store unused or deliberately bypassed (not configured, circuit open)
    Degraded,
    /// Store unreachable or too slow
    Unhealthy,
}

impl HealthStatus {
    /// Classify the result of a health probe
    pub fn from_result<T>(result: &CacheResult<T>) -> Self {
        match result {
            Ok(_) => HealthStatus::Healthy,
            Err(CacheError::ConfigurationMissing(_)) | Err(CacheError::CircuitOpen { .. }) => {
                HealthStatus::Degraded
            }
            Err(CacheError::Connectivity(_)) | Err(CacheError::Timeout(_)) => {
                HealthStatus::Unhealthy
            }
            // The store answered, so it is reachable
            Err(_) => HealthStatus::Degraded,
        }
    }

    /// Worst of two statuses
    pub fn combine(self, other: HealthStatus) -> HealthStatus {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

/// Aggregated health for the cache and lock coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub cache: HealthStatus,
    pub lock: HealthStatus,
    pub breaker_state: CircuitState,
    pub operations_completed: u64,
    pub container: String,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    pub fn new(
        cache: HealthStatus,
        lock: HealthStatus,
        breaker_state: CircuitState,
        operations_completed: u64,
        container: &ContainerIdentity,
    ) -> Self {
        Self {
            status: cache.combine(lock),
            cache,
            lock,
            breaker_state,
            operations_completed,
            container: container.to_string(),
            checked_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(HealthStatus::from_result(&Ok(())), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::from_result::<()>(&Err(CacheError::ConfigurationMissing("url".into()))),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::from_result::<()>(&Err(CacheError::CircuitOpen {
                component: "cache".into()
            })),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::from_result::<()>(&Err(CacheError::Timeout("5s".into()))),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_report_takes_worst_status() {
        let report = HealthReport::new(
            HealthStatus::Healthy,
            HealthStatus::Degraded,
            CircuitState::Closed,
            12,
            &ContainerIdentity::new("api-1"),
        );
        assert_eq!(report.status, HealthStatus::Degraded);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["cache"], "healthy");
        assert_eq!(json["breaker_state"], "closed");
        assert_eq!(json["container"], "api-1");
    }
}
