//! Connection lifecycle events
//!
//! Published on a broadcast channel by [`super::ConnectionManager`]. Subscribing is
//! optional; events are dropped when nobody listens.

use serde::{Deserialize, Serialize};

/// A connection lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// First handle established
    Established { component: String, endpoint: String },
    /// A new handle replaced a lost one
    Restored {
        component: String,
        endpoint: String,
        generation: u64,
    },
    /// Handshake failed after all retries
    Failed {
        component: String,
        endpoint: String,
        error: String,
    },
    /// The live handle reported an unexpected error and was discarded
    InternalError { component: String, error: String },
    /// The handle was disposed on shutdown
    Closed { component: String },
}

impl ConnectionEvent {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Established { .. } => "established",
            ConnectionEvent::Restored { .. } => "restored",
            ConnectionEvent::Failed { .. } => "failed",
            ConnectionEvent::InternalError { .. } => "internal_error",
            ConnectionEvent::Closed { .. } => "closed",
        }
    }

    pub fn component(&self) -> &str {
        match self {
            ConnectionEvent::Established { component, .. }
            | ConnectionEvent::Restored { component, .. }
            | ConnectionEvent::Failed { component, .. }
            | ConnectionEvent::InternalError { component, .. }
            | ConnectionEvent::Closed { component } => component,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ConnectionEvent::Restored {
            component: "cache".to_string(),
            endpoint: "redis://localhost:6379".to_string(),
            generation: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "restored");
        assert_eq!(json["generation"], 2);
        assert_eq!(event.name(), "restored");
        assert_eq!(event.component(), "cache");
    }
}
