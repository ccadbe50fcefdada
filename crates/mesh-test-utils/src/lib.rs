//! Test utilities for the Mesh Rooms client core.
//!
//! # Modules
//!
//! - [`media`] - `FakeTrack` and `FakeDevices` with injectable failures
//! - [`transport`] - `FakeTransport` and its factory, recording every
//!   description, candidate and sender substitution
//! - [`signaling`] - `RecordingSignaling`, the in-order `SignalingBus` and
//!   `RecordingFanout`
//! - [`hub`] - `TestHub`, a real hub on an ephemeral port
//! - [`wait`] - polling helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_test_utils::*;
//!
//! let bus = SignalingBus::new();
//! let factory = FakeTransportFactory::new();
//! let (tracks_tx, tracks_rx) = watch::channel(Some(outbound_tracks()));
//! // Build an EngineContext around `bus.endpoint(id)`, `factory` and `tracks_rx`,
//! // spawn the engines, then let payloads flow:
//! bus.start(vec![engine_a.clone(), engine_b.clone()]);
//! assert!(eventually(WAIT_TIMEOUT, || factory.created() == 2).await);
//! ```

pub mod hub;
pub mod media;
pub mod signaling;
pub mod transport;
pub mod wait;

pub use hub::TestHub;
pub use media::{outbound_tracks, FakeDevices, FakeTrack};
pub use signaling::{BusEndpoint, Envelope, RecordingFanout, RecordingSignaling, SignalingBus, SignalingCall};
pub use transport::{FakeSender, FakeTransport, FakeTransportFactory};
pub use wait::{drain, eventually, next_matching, WAIT_TIMEOUT};
