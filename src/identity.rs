//! # Container Identity
//!
//! Process-wide immutable identifier used to tag logs. Resolved once from the
//! orchestrator-provided name, falling back to a generated value.

use std::fmt;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

static PROCESS_IDENTITY: OnceLock<ContainerIdentity> = OnceLock::new();

/// Environment variables consulted, in order
const IDENTITY_VARS: [&str; 3] = ["CONTAINER_NAME", "POD_NAME", "HOSTNAME"];

/// Identifier of the running container or process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerIdentity(Arc<str>);

impl ContainerIdentity {
    /// Use an explicit identifier
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::from(name.into()))
    }

    /// Resolve from the environment, generating `local-<8 hex>` when nothing is set
    pub fn detect() -> Self {
        Self::detect_with(|var| std::env::var(var).ok())
    }

    fn detect_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        IDENTITY_VARS
            .iter()
            .filter_map(|var| lookup(*var))
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty())
            .map(Self::new)
            .unwrap_or_else(|| {
                let generated = Uuid::new_v4().simple().to_string();
                Self::new(format!("local-{}", &generated[..8]))
            })
    }

    /// Identity shared by the whole process
    pub fn process() -> ContainerIdentity {
        PROCESS_IDENTITY.get_or_init(Self::detect).clone()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_prefers_container_name() {
        let vars: HashMap<&str, &str> =
            [("CONTAINER_NAME", "api-7f9c"), ("HOSTNAME", "node-3")].into();
        let identity = ContainerIdentity::detect_with(|v| vars.get(v).map(|s| s.to_string()));
        assert_eq!(identity.as_str(), "api-7f9c");
    }

    #[test]
    fn test_skips_blank_values() {
        let vars: HashMap<&str, &str> = [("CONTAINER_NAME", "  "), ("POD_NAME", "worker-0")].into();
        let identity = ContainerIdentity::detect_with(|v| vars.get(v).map(|s| s.to_string()));
        assert_eq!(identity.to_string(), "worker-0");
    }

    #[test]
    fn test_generated_fallback() {
        let identity = ContainerIdentity::detect_with(|_| None);
        assert!(identity.as_str().starts_with("local-"));
        assert_eq!(identity.as_str().len(), "local-".len() + 8);
    }

    #[test]
    fn test_process_identity_is_stable() {
        assert_eq!(ContainerIdentity::process(), ContainerIdentity::process());
    }
}
