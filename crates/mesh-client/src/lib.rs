//! Mesh Rooms client core.
//!
//! Everything a participant needs to take part in a full-mesh room, minus the
//! media stack itself (devices and peer transports are traits):
//!
//! ```text
//! MeshSession
//! ├── HubClient            (hub WebSocket, SignalingChannel)
//! ├── NegotiationEngine    (supervisor, keyed by PairKey)
//! │   └── PeerActor        (one per remote participant, owns its PeerLink)
//! └── TrackController      (microphone, camera, screen; OutboundVideo)
//! ```
//!
//! # Modules
//!
//! - [`engine`] / [`link`] - Per-pair offer/answer state machine with glare
//!   resolution, candidate buffering and generation-tagged retries
//! - [`tracks`] - Local capture sources and sender-level substitution
//! - [`classify`] - Camera vs screen classification of inbound video
//! - [`session`] - Hub event routing
//! - [`hub_client`] - `tokio-tungstenite` client for the hub
//! - [`config`] - Client configuration from environment
//! - [`errors`] - Error types per layer
//! - [`media`], [`transport`], [`signaling`] - Seams to the platform

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod classify;
pub mod config;
pub mod engine;
pub mod errors;
pub mod hub_client;
pub mod link;
pub mod media;
mod peer;
pub mod session;
pub mod signaling;
pub mod tracks;
pub mod transport;

pub use engine::{EngineContext, EngineEvent, NegotiationEngine, NegotiationEngineHandle};
pub use errors::{DeviceError, MeshError, NegotiationError, TransportError};
pub use session::{MeshSession, MeshSessionHandle, SessionConfig, SessionDeps, SessionEvent};
pub use tracks::{ShareOutcome, TrackController, TrackControllerHandle};
