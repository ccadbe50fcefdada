//! Client configuration.
//!
//! Loaded from `MESH_*` environment variables. Only the hub URL is required.
//! [`MeshSession::join`](crate::session::MeshSession::join) consumes it.

use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default ICE server list.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

/// Default time to wait for an answer before retrying an offer.
pub const DEFAULT_ANSWER_TIMEOUT_MS: u64 = 10_000;

/// Default delay before a failed negotiation step is retried.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Default number of retries per link before a failure is surfaced.
pub const DEFAULT_RETRY_LIMIT: u32 = 1;

/// Default number of early ICE candidates held per link.
pub const DEFAULT_CANDIDATE_BUFFER: usize = 64;

/// Negotiation tuning shared by every peer actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// STUN/TURN URLs handed to each new transport.
    pub ice_servers: Vec<String>,
    pub answer_timeout: Duration,
    pub retry_delay: Duration,
    pub retry_limit: u32,
    /// Candidates buffered per link before the remote description is
    /// applied. The oldest is dropped when full.
    pub candidate_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
            answer_timeout: Duration::from_millis(DEFAULT_ANSWER_TIMEOUT_MS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            retry_limit: DEFAULT_RETRY_LIMIT,
            candidate_buffer: DEFAULT_CANDIDATE_BUFFER,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Hub WebSocket URL, e.g. `ws://localhost:4000/ws`.
    pub hub_url: String,

    pub engine: EngineConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl MeshConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let hub_url = vars
            .get("MESH_HUB_URL")
            .filter(|url| !url.trim().is_empty())
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar("MESH_HUB_URL".to_string()))?;

        if !(hub_url.starts_with("ws://") || hub_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "MESH_HUB_URL must use ws:// or wss://, got {hub_url}"
            )));
        }

        let ice_servers = match vars.get("MESH_ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => vec![DEFAULT_ICE_SERVER.to_string()],
        };

        let answer_timeout = Duration::from_millis(parse_or(vars, "MESH_ANSWER_TIMEOUT_MS", DEFAULT_ANSWER_TIMEOUT_MS)?);
        let retry_delay = Duration::from_millis(parse_or(vars, "MESH_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS)?);
        let retry_limit = parse_or(vars, "MESH_RETRY_LIMIT", DEFAULT_RETRY_LIMIT)?;

        let candidate_buffer = parse_or(vars, "MESH_CANDIDATE_BUFFER", DEFAULT_CANDIDATE_BUFFER)?;
        if candidate_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "MESH_CANDIDATE_BUFFER must be greater than zero".to_string(),
            ));
        }

        Ok(MeshConfig {
            hub_url,
            engine: EngineConfig {
                ice_servers,
                answer_timeout,
                retry_delay,
                retry_limit,
                candidate_buffer,
            },
        })
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_requires_hub_url() {
        let result = MeshConfig::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(key)) if key == "MESH_HUB_URL"));
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = MeshConfig::from_vars(&vars(&[("MESH_HUB_URL", "ws://localhost:4000/ws")]))
            .expect("Config should load successfully");

        assert_eq!(config.hub_url, "ws://localhost:4000/ws");
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.engine.ice_servers, vec![DEFAULT_ICE_SERVER.to_string()]);
    }

    #[test]
    fn test_from_vars_custom_values() {
        let config = MeshConfig::from_vars(&vars(&[
            ("MESH_HUB_URL", "wss://hub.example.com/ws"),
            ("MESH_ICE_SERVERS", "stun:a:3478, turn:b:3478 ,"),
            ("MESH_ANSWER_TIMEOUT_MS", "2500"),
            ("MESH_RETRY_DELAY_MS", "50"),
            ("MESH_RETRY_LIMIT", "3"),
            ("MESH_CANDIDATE_BUFFER", "8"),
        ]))
        .expect("Config should load successfully");

        assert_eq!(config.engine.ice_servers, vec!["stun:a:3478".to_string(), "turn:b:3478".to_string()]);
        assert_eq!(config.engine.answer_timeout, Duration::from_millis(2500));
        assert_eq!(config.engine.retry_delay, Duration::from_millis(50));
        assert_eq!(config.engine.retry_limit, 3);
        assert_eq!(config.engine.candidate_buffer, 8);
    }

    #[test]
    fn test_from_vars_rejects_bad_values() {
        let result = MeshConfig::from_vars(&vars(&[("MESH_HUB_URL", "http://localhost:4000")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("MESH_HUB_URL")));

        let result = MeshConfig::from_vars(&vars(&[
            ("MESH_HUB_URL", "ws://localhost:4000/ws"),
            ("MESH_RETRY_LIMIT", "many"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("MESH_RETRY_LIMIT")));

        let result = MeshConfig::from_vars(&vars(&[
            ("MESH_HUB_URL", "ws://localhost:4000/ws"),
            ("MESH_CANDIDATE_BUFFER", "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }
}
