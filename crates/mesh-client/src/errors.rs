//! Client error types.
//!
//! `DeviceError`, `NegotiationError` and `TransportError` each belong to one
//! layer; `MeshError` is what public handles return.

use common::error::ProtocolError;
use thiserror::Error;

/// Capture device acquisition failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The user or platform refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No device of the requested kind exists.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The user dismissed the picker.
    #[error("Capture cancelled by user")]
    Cancelled,

    #[error("Capture failed: {0}")]
    Failed(String),
}

/// SDP generation or application failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Failed to create offer: {0}")]
    CreateOffer(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("Failed to set local description: {0}")]
    SetLocalDescription(String),

    #[error("Failed to set remote description: {0}")]
    SetRemoteDescription(String),

    /// No answer arrived for our offer in time.
    #[error("No answer within {0} ms")]
    AnswerTimeout(u64),

    /// Local tracks are not available (media was never initialized).
    #[error("Local tracks unavailable")]
    TracksUnavailable,
}

/// Peer transport failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to create transport: {0}")]
    Create(String),

    #[error("Failed to attach track: {0}")]
    AddTrack(String),

    #[error("Failed to replace track: {0}")]
    ReplaceTrack(String),

    #[error("Rejected ICE candidate: {0}")]
    Candidate(String),

    #[error("Transport closed")]
    Closed,
}

/// Client error type.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Hub connection is unavailable or refused a frame.
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Operation not valid in the current local state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Actor channel failures and similar.
    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_errors_convert_into_mesh_error() {
        let err: MeshError = DeviceError::Cancelled.into();
        assert!(matches!(err, MeshError::Device(DeviceError::Cancelled)));

        let err: MeshError = NegotiationError::AnswerTimeout(10_000).into();
        assert_eq!(err.to_string(), "Negotiation error: No answer within 10000 ms");

        let err: MeshError = TransportError::Closed.into();
        assert!(matches!(err, MeshError::Transport(TransportError::Closed)));

        let err: MeshError = ProtocolError::Malformed("x".to_string()).into();
        assert!(matches!(err, MeshError::Protocol(_)));
    }
}
