//! Signaling payloads and the channel that carries them.
//!
//! The hub relays `signal` payloads opaquely; their shape is agreed between
//! clients:
//!
//! ```text
//! {"type": "offer",     "sdp": "...", "negotiationId": 2}
//! {"type": "answer",    "sdp": "...", "negotiationId": 2}
//! {"type": "candidate", "candidate": {"candidate": "...", "sdpMid": "0", "sdpMLineIndex": 0}}
//! ```
//!
//! `negotiationId` is the offerer's link generation. An answer echoes the id of
//! the offer it answers so the offerer can tell it from an answer to an offer
//! it has since abandoned.

use crate::errors::MeshError;
use crate::transport::{IceCandidate, SdpType, SessionDescription};

use async_trait::async_trait;
use common::error::ProtocolError;
use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

/// One peer-to-peer signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        sdp: String,
        #[serde(rename = "negotiationId")]
        negotiation: u64,
    },
    Answer {
        sdp: String,
        #[serde(rename = "negotiationId")]
        negotiation: u64,
    },
    Candidate { candidate: IceCandidate },
}

impl SignalPayload {
    /// Decode a relayed payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("signal payload: {e}")))
    }

    pub fn to_value(&self) -> Result<serde_json::Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Payload type name, for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate { .. } => "candidate",
        }
    }

    /// Wrap a local description for the negotiation tagged `negotiation`.
    #[must_use]
    pub fn from_description(description: SessionDescription, negotiation: u64) -> Self {
        let sdp = description.sdp;
        match description.sdp_type {
            SdpType::Offer => SignalPayload::Offer { sdp, negotiation },
            SdpType::Answer => SignalPayload::Answer { sdp, negotiation },
        }
    }
}

/// Outbound path to the hub used by the engine and the track controller.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a payload to one participant through the hub.
    async fn send_signal(&self, to: ParticipantId, payload: SignalPayload) -> Result<(), MeshError>;

    /// Claim the room's screen share.
    async fn start_share(&self, room_id: &RoomId, name: &str) -> Result<(), MeshError>;

    /// Release the room's screen share. The hub ignores non-owners.
    async fn stop_share(&self, room_id: &RoomId) -> Result<(), MeshError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_payload_shape() {
        let payload = SignalPayload::Offer {
            sdp: "v=0".to_string(),
            negotiation: 3,
        };
        assert_eq!(
            payload.to_value().unwrap(),
            json!({"type": "offer", "sdp": "v=0", "negotiationId": 3})
        );
    }

    #[test]
    fn test_candidate_payload_decodes() {
        let value = json!({
            "type": "candidate",
            "candidate": {"candidate": "candidate:0 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        });

        let payload = SignalPayload::from_value(value).unwrap();
        assert_eq!(payload.name(), "candidate");
        match payload {
            SignalPayload::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => unreachable!("expected candidate, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_payload_type_is_malformed() {
        let result = SignalPayload::from_value(json!({"type": "renegotiate"}));
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));

        let result = SignalPayload::from_value(json!({"sdp": "v=0"}));
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_answer_without_negotiation_id_is_malformed() {
        let result = SignalPayload::from_value(json!({"type": "answer", "sdp": "v=0"}));
        assert!(matches!(result, Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_from_description() {
        let payload = SignalPayload::from_description(SessionDescription::answer("a"), 7);
        assert_eq!(
            payload,
            SignalPayload::Answer {
                sdp: "a".to_string(),
                negotiation: 7
            }
        );
    }
}
