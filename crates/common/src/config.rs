//! Common configuration types for Mesh Rooms components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default log filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `<PREFIX>_LOG_LEVEL` and `<PREFIX>_LOG_JSON` from a variable map.
    ///
    /// Unparseable booleans fall back to plain-text logs.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>, prefix: &str) -> Self {
        let log_level = vars
            .get(&format!("{prefix}_LOG_LEVEL"))
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let json_logs = vars
            .get(&format!("{prefix}_LOG_JSON"))
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        Self {
            log_level,
            json_logs,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_defaults() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "HUB");
        assert_eq!(config, ObservabilityConfig::default());
    }

    #[test]
    fn test_observability_from_prefixed_vars() {
        let vars = HashMap::from([
            ("HUB_LOG_LEVEL".to_string(), "debug".to_string()),
            ("HUB_LOG_JSON".to_string(), "true".to_string()),
        ]);

        let config = ObservabilityConfig::from_vars(&vars, "HUB");
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
    }

    #[test]
    fn test_observability_ignores_bad_bool() {
        let vars = HashMap::from([("MESH_LOG_JSON".to_string(), "yes please".to_string())]);

        let config = ObservabilityConfig::from_vars(&vars, "MESH");
        assert!(!config.json_logs);
    }
}
