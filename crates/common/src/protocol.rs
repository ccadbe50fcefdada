//! Hub wire protocol.
//!
//! Every WebSocket text frame carries one JSON object of the form
//! `{"event": "<kebab-case name>", "data": {<camelCase fields>}}`.
//!
//! Signaling payloads are opaque to the hub and are carried as raw JSON
//! values; the client decodes them into typed offers, answers and candidates.

use crate::error::ProtocolError;
use crate::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

/// A room member as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ParticipantId,
    pub name: String,
}

/// Current screen-share owner of a room; both fields are `null` when nobody
/// is sharing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareState {
    pub owner_id: Option<ParticipantId>,
    pub owner_name: Option<String>,
}

impl ShareState {
    /// Share state owned by the given participant.
    #[must_use]
    pub fn owned_by(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            owner_id: Some(id),
            owner_name: Some(name.into()),
        }
    }

    /// Whether `id` is the registered owner.
    #[must_use]
    pub fn is_owner(&self, id: ParticipantId) -> bool {
        self.owner_id == Some(id)
    }
}

/// Events sent from a client to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        name: String,
    },
    LeaveRoom {
        room_id: RoomId,
    },
    GetRooms,
    StartShare {
        room_id: RoomId,
        #[serde(default)]
        name: String,
    },
    StopShare {
        room_id: RoomId,
    },
    /// Relay `payload` to `to`. Any `from` supplied by the client is ignored;
    /// the hub stamps its own view of the sender.
    Signal {
        to: ParticipantId,
        payload: serde_json::Value,
    },
    ChatMessage {
        room_id: RoomId,
        text: String,
        #[serde(default)]
        name: String,
        ts: i64,
    },
}

/// Events sent from the hub to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// First frame on every connection: the hub-assigned participant id.
    Welcome { id: ParticipantId },
    CurrentPeers {
        room_id: RoomId,
        peers: Vec<PeerInfo>,
        share: ShareState,
    },
    PeerJoined {
        room_id: RoomId,
        id: ParticipantId,
        name: String,
    },
    PeerLeft {
        room_id: RoomId,
        id: ParticipantId,
    },
    Rooms { room_ids: Vec<RoomId> },
    ShareStarted {
        room_id: RoomId,
        id: ParticipantId,
        name: String,
    },
    ShareStopped { room_id: RoomId },
    Signal {
        from: ParticipantId,
        payload: serde_json::Value,
    },
    ChatMessage {
        room_id: RoomId,
        from: ParticipantId,
        text: String,
        name: String,
        ts: i64,
    },
    Error { code: i32, message: String },
}

impl ClientEvent {
    /// Decode a client frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the text is not a known event.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode this event as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Short event name for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::GetRooms => "get-rooms",
            ClientEvent::StartShare { .. } => "start-share",
            ClientEvent::StopShare { .. } => "stop-share",
            ClientEvent::Signal { .. } => "signal",
            ClientEvent::ChatMessage { .. } => "chat-message",
        }
    }
}

impl ServerEvent {
    /// Decode a server frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the text is not a known event.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode this event as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Short event name for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            ServerEvent::Welcome { .. } => "welcome",
            ServerEvent::CurrentPeers { .. } => "current-peers",
            ServerEvent::PeerJoined { .. } => "peer-joined",
            ServerEvent::PeerLeft { .. } => "peer-left",
            ServerEvent::Rooms { .. } => "rooms",
            ServerEvent::ShareStarted { .. } => "share-started",
            ServerEvent::ShareStopped { .. } => "share-stopped",
            ServerEvent::Signal { .. } => "signal",
            ServerEvent::ChatMessage { .. } => "chat-message",
            ServerEvent::Error { .. } => "error",
        }
    }
}
