//! Common error types for Mesh Rooms components.

use thiserror::Error;

/// Errors raised while encoding or decoding hub protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known event
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Event could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using `ProtocolError`
pub type Result<T> = std::result::Result<T, ProtocolError>;
