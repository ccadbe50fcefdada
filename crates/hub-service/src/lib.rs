//! Rendezvous hub library.
//!
//! The hub is the meeting point of a mesh room: it tracks ephemeral room
//! membership, arbitrates the single screen-share slot of each room and
//! relays opaque signaling payloads between participants. It never sees
//! media.
//!
//! # Architecture
//!
//! ```text
//! axum router
//! ├── GET /ws ──▶ ws::handle_socket (reader, one per socket)
//! │                   │ ClientEvent
//! │                   ▼
//! │               HubActor (singleton, owns SessionDirectory)
//! │                   │ ServerEvent (try_send)
//! │                   ▼
//! │               ConnectionActor (writer, one per socket)
//! ├── GET /health, GET /ready
//! └── GET /metrics
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Hub and connection actors
//! - [`config`] - Service configuration from environment
//! - [`directory`] - Rooms, membership and share ownership
//! - [`errors`] - Error types with client-facing error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`ws`] - WebSocket transport

pub mod actors;
pub mod config;
pub mod directory;
pub mod errors;
pub mod observability;
pub mod ws;
