//! Actor model implementation for the rendezvous hub.
//!
//! ```text
//! HubActor (singleton per hub instance)
//! ├── owns the SessionDirectory (rooms, members, share owners)
//! └── supervises N ConnectionActors
//!     └── ConnectionActor (one per WebSocket, owns the write half)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single owner**: only the `HubActor` reads or mutates room state, so
//!   every room operation is serialized by one mailbox
//! - **Non-blocking fan-out**: the hub enqueues with `try_send`; a full
//!   connection mailbox drops that event for that client only
//! - **CancellationToken propagation**: connection actors run on child tokens
//!   of the hub's token
//! - **Mailbox monitoring**: depth thresholds per actor type (Hub: 200/1000,
//!   Connection: 64/256)
//!
//! # Modules
//!
//! - [`hub`] - `HubActor` singleton and its handle
//! - [`connection`] - `ConnectionActor` per WebSocket
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod hub;
pub mod messages;
pub mod metrics;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle};
pub use hub::{HubActor, HubActorHandle};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
