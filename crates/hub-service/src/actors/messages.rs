//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use crate::directory::RoomSnapshot;
use crate::errors::HubError;

use common::protocol::{PeerInfo, ServerEvent, ShareState};
use common::types::{ParticipantId, RoomId};
use futures::Sink;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Outbound half of a client connection, already mapped to hub events.
///
/// The WebSocket handler wraps the socket's write half; tests use an
/// in-memory channel.
pub type EventSink = Pin<Box<dyn Sink<ServerEvent, Error = HubError> + Send>>;

/// Messages sent to `HubActor`.
pub enum HubMessage {
    /// A new connection was accepted; assign an id and start its writer.
    Connect {
        sink: EventSink,
        /// Response channel for the assigned participant id.
        respond_to: oneshot::Sender<Result<ParticipantId, HubError>>,
    },

    /// The connection's read half ended.
    Disconnect { participant_id: ParticipantId },

    /// Join a room (creating it if needed).
    Join {
        participant_id: ParticipantId,
        room_id: RoomId,
        name: String,
        /// Response channel for the join result.
        respond_to: oneshot::Sender<Result<JoinResult, HubError>>,
    },

    /// Leave a single room.
    Leave {
        participant_id: ParticipantId,
        room_id: RoomId,
    },

    /// Send the room list to one connection.
    RequestRooms { participant_id: ParticipantId },

    /// Snapshot of non-empty room ids.
    GetRooms {
        respond_to: oneshot::Sender<Vec<RoomId>>,
    },

    /// Claim the room's screen share (last writer wins).
    StartShare {
        participant_id: ParticipantId,
        room_id: RoomId,
        name: String,
        /// Response channel for confirmation.
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },

    /// Release the room's screen share if held by the requester.
    StopShare {
        participant_id: ParticipantId,
        room_id: RoomId,
        /// Response channel: `true` if ownership was cleared.
        respond_to: oneshot::Sender<bool>,
    },

    /// Relay an opaque signaling payload to one participant.
    Relay {
        from: ParticipantId,
        to: ParticipantId,
        payload: serde_json::Value,
    },

    /// Broadcast a chat line to a room.
    Chat {
        from: ParticipantId,
        room_id: RoomId,
        text: String,
        name: String,
        ts: i64,
    },

    /// Report a rejected client frame back to its sender.
    ClientError {
        participant_id: ParticipantId,
        error: HubError,
    },

    /// Get current hub state (for debugging/health).
    GetState {
        /// Response channel for hub state.
        respond_to: oneshot::Sender<HubState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write an event to the client.
    Send { event: ServerEvent },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    pub room_id: RoomId,
    /// Members other than the joiner.
    pub peers: Vec<PeerInfo>,
    pub share: ShareState,
}

/// Hub state snapshot.
#[derive(Debug, Clone)]
pub struct HubState {
    pub hub_id: String,
    pub connections: usize,
    pub rooms: Vec<RoomSnapshot>,
    pub is_shutting_down: bool,
}
