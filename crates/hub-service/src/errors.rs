//! Hub error types.
//!
//! Error codes are sent to clients in `error` events. Internal details are
//! logged server-side but not exposed to clients.

use thiserror::Error;

/// Hub error type.
///
/// Maps to client-facing error codes:
/// - `Protocol`: `BAD_REQUEST` (1)
/// - `NotMember`: `FORBIDDEN` (3)
/// - `RoomNotFound`: `NOT_FOUND` (4)
/// - `Transport`, `Internal`: `INTERNAL_ERROR` (6)
/// - `Backpressure`, `Draining`: `UNAVAILABLE` (7)
#[derive(Debug, Error)]
pub enum HubError {
    /// Client frame could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Room does not exist (it was never created or is already empty).
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Participant attempted a room operation without being a member.
    #[error("Not a member of room: {0}")]
    NotMember(String),

    /// Participant has no live connection.
    #[error("Participant not connected: {0}")]
    NotConnected(String),

    /// WebSocket write failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Outbound mailbox for a connection is full.
    #[error("Connection mailbox full")]
    Backpressure,

    /// Hub is shutting down.
    #[error("Hub is draining")]
    Draining,

    /// Internal error (actor channel failures and similar).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns the numeric error code sent to clients.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            HubError::Protocol(_) => 1,                                    // BAD_REQUEST
            HubError::NotMember(_) => 3,                                   // FORBIDDEN
            HubError::RoomNotFound(_) | HubError::NotConnected(_) => 4,    // NOT_FOUND
            HubError::Transport(_) | HubError::Internal(_) => 6,           // INTERNAL_ERROR
            HubError::Backpressure | HubError::Draining => 7,              // UNAVAILABLE
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            HubError::Protocol(_) => "Malformed message".to_string(),
            HubError::RoomNotFound(_) => "Room not found".to_string(),
            HubError::NotMember(_) => "Not a member of this room".to_string(),
            HubError::NotConnected(_) => "Participant not connected".to_string(),
            HubError::Transport(_) | HubError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            HubError::Backpressure => "Server is busy, please retry".to_string(),
            HubError::Draining => "Server is shutting down, please reconnect".to_string(),
        }
    }
}

impl From<common::error::ProtocolError> for HubError {
    fn from(err: common::error::ProtocolError) -> Self {
        HubError::Protocol(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::error::ProtocolError;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(HubError::Protocol("bad".to_string()).error_code(), 1);
        assert_eq!(HubError::NotMember("abc".to_string()).error_code(), 3);
        assert_eq!(HubError::RoomNotFound("abc".to_string()).error_code(), 4);
        assert_eq!(HubError::NotConnected("p".to_string()).error_code(), 4);
        assert_eq!(HubError::Transport("reset".to_string()).error_code(), 6);
        assert_eq!(HubError::Internal("oops".to_string()).error_code(), 6);
        assert_eq!(HubError::Backpressure.error_code(), 7);
        assert_eq!(HubError::Draining.error_code(), 7);
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let msg = HubError::Internal("channel send failed: closed".to_string()).client_message();
        assert!(!msg.contains("channel"));

        let msg = HubError::Transport("broken pipe".to_string()).client_message();
        assert!(!msg.contains("pipe"));

        let msg = HubError::RoomNotFound("secret-room".to_string()).client_message();
        assert!(!msg.contains("secret-room"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err: HubError = ProtocolError::Malformed("eof".to_string()).into();
        assert!(matches!(err, HubError::Protocol(_)));
        assert_eq!(err.error_code(), 1);
    }
}
