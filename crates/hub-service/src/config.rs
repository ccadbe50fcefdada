//! Hub configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default so the hub starts with an empty environment.

use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use thiserror::Error;

/// Default bind address for the WebSocket, health and metrics listener.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default per-connection outbound mailbox size.
pub const DEFAULT_CONNECTION_BUFFER: usize = 256;

/// Default time allowed for actors to drain on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 5;

/// Default hub instance ID prefix.
pub const DEFAULT_HUB_ID_PREFIX: &str = "hub";

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener bind address (default: "0.0.0.0:4000").
    pub bind_address: SocketAddr,

    /// Unique identifier for this hub instance.
    pub hub_id: String,

    /// Outbound mailbox size for each connection actor. Events for a
    /// connection whose mailbox is full are dropped.
    pub connection_buffer: usize,

    /// Seconds to wait for actors to finish on shutdown.
    pub shutdown_grace_seconds: u64,

    /// Log format and level.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("HUB_BIND_ADDRESS")
            .map_or(DEFAULT_BIND_ADDRESS, String::as_str)
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("HUB_BIND_ADDRESS: {e}")))?;

        let connection_buffer = match vars.get("HUB_CONNECTION_BUFFER") {
            Some(raw) => {
                let value: usize = raw
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("HUB_CONNECTION_BUFFER: {e}")))?;
                if value == 0 {
                    return Err(ConfigError::InvalidValue(
                        "HUB_CONNECTION_BUFFER must be greater than zero".to_string(),
                    ));
                }
                value
            }
            None => DEFAULT_CONNECTION_BUFFER,
        };

        let shutdown_grace_seconds = vars
            .get("HUB_SHUTDOWN_GRACE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECONDS);

        let hub_id = vars.get("HUB_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_HUB_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let observability = ObservabilityConfig::from_vars(vars, "HUB");

        Ok(Config {
            bind_address,
            hub_id,
            connection_buffer,
            shutdown_grace_seconds,
            observability,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), DEFAULT_BIND_ADDRESS);
        assert_eq!(config.connection_buffer, DEFAULT_CONNECTION_BUFFER);
        assert_eq!(config.shutdown_grace_seconds, DEFAULT_SHUTDOWN_GRACE_SECONDS);
        assert!(!config.observability.json_logs);
        // Hub ID should be auto-generated
        assert!(config.hub_id.starts_with("hub-"));
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("HUB_BIND_ADDRESS".to_string(), "127.0.0.1:4100".to_string()),
            ("HUB_ID".to_string(), "hub-custom-001".to_string()),
            ("HUB_CONNECTION_BUFFER".to_string(), "32".to_string()),
            ("HUB_SHUTDOWN_GRACE_SECONDS".to_string(), "1".to_string()),
            ("HUB_LOG_JSON".to_string(), "true".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:4100");
        assert_eq!(config.hub_id, "hub-custom-001");
        assert_eq!(config.connection_buffer, 32);
        assert_eq!(config.shutdown_grace_seconds, 1);
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_from_vars_invalid_bind_address() {
        let vars = HashMap::from([("HUB_BIND_ADDRESS".to_string(), "not-an-addr".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("HUB_BIND_ADDRESS")));
    }

    #[test]
    fn test_from_vars_rejects_zero_buffer() {
        let vars = HashMap::from([("HUB_CONNECTION_BUFFER".to_string(), "0".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_invalid_buffer() {
        let vars = HashMap::from([("HUB_CONNECTION_BUFFER".to_string(), "lots".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("HUB_CONNECTION_BUFFER")));
    }
}
