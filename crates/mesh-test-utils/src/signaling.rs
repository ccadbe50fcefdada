//! In-memory signaling: a recorder for single-engine tests and a bus that
//! relays between several engines.

use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use mesh_client::engine::NegotiationEngineHandle;
use mesh_client::errors::MeshError;
use mesh_client::media::{MediaKind, SharedTrack};
use mesh_client::signaling::{SignalPayload, SignalingChannel};
use mesh_client::tracks::TrackSubstitution;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One call made on a `SignalingChannel`.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingCall {
    Signal { to: ParticipantId, payload: SignalPayload },
    StartShare { room_id: RoomId, name: String },
    StopShare { room_id: RoomId },
}

/// Records every call and delivers nothing.
#[derive(Default)]
pub struct RecordingSignaling {
    calls: Mutex<Vec<SignalingCall>>,
}

impl RecordingSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SignalingCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Payloads sent to `to`, in order.
    pub fn signals_to(&self, to: ParticipantId) -> Vec<SignalPayload> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SignalingCall::Signal { to: target, payload } if target == to => Some(payload),
                _ => None,
            })
            .collect()
    }

    /// SDPs of the offers sent to `to`.
    pub fn offers_to(&self, to: ParticipantId) -> Vec<String> {
        self.signals_to(to)
            .into_iter()
            .filter_map(|payload| match payload {
                SignalPayload::Offer { sdp, .. } => Some(sdp),
                _ => None,
            })
            .collect()
    }

    pub fn answers_to(&self, to: ParticipantId) -> Vec<String> {
        self.signals_to(to)
            .into_iter()
            .filter_map(|payload| match payload {
                SignalPayload::Answer { sdp, .. } => Some(sdp),
                _ => None,
            })
            .collect()
    }

    /// `StartShare` / `StopShare` calls only.
    pub fn share_calls(&self) -> Vec<SignalingCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, SignalingCall::Signal { .. }))
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send_signal(&self, to: ParticipantId, payload: SignalPayload) -> Result<(), MeshError> {
        self.calls.lock().unwrap().push(SignalingCall::Signal { to, payload });
        Ok(())
    }

    async fn start_share(&self, room_id: &RoomId, name: &str) -> Result<(), MeshError> {
        self.calls.lock().unwrap().push(SignalingCall::StartShare {
            room_id: room_id.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn stop_share(&self, room_id: &RoomId) -> Result<(), MeshError> {
        self.calls.lock().unwrap().push(SignalingCall::StopShare {
            room_id: room_id.clone(),
        });
        Ok(())
    }
}

/// A relayed payload.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub payload: SignalPayload,
}

/// In-order relay between engines, standing in for the hub.
///
/// Payloads queue until `start` is called, so tests can let several engines
/// offer before anything is delivered.
pub struct SignalingBus {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    log: Arc<Mutex<Vec<Envelope>>>,
}

impl SignalingBus {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            log: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Signaling channel for participant `local`.
    pub fn endpoint(&self, local: ParticipantId) -> Arc<BusEndpoint> {
        Arc::new(BusEndpoint {
            local,
            sender: self.sender.clone(),
            log: Arc::clone(&self.log),
            shares: Mutex::new(Vec::new()),
        })
    }

    /// Start delivering, queued payloads first.
    ///
    /// Panics if called twice.
    pub fn start(&self, engines: Vec<NegotiationEngineHandle>) -> JoinHandle<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .expect("signaling bus already started");
        let engines: HashMap<ParticipantId, NegotiationEngineHandle> =
            engines.into_iter().map(|engine| (engine.local_id(), engine)).collect();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                if let Some(engine) = engines.get(&envelope.to) {
                    let _ = engine.handle_signal(envelope.from, envelope.payload).await;
                }
            }
        })
    }

    /// Every payload sent so far, in send order.
    pub fn log(&self) -> Vec<Envelope> {
        self.log.lock().unwrap().clone()
    }

    /// Number of offers `from` has sent.
    pub fn offers_from(&self, from: ParticipantId) -> usize {
        self.log()
            .iter()
            .filter(|envelope| envelope.from == from && matches!(envelope.payload, SignalPayload::Offer { .. }))
            .count()
    }
}

/// One participant's view of the bus.
pub struct BusEndpoint {
    local: ParticipantId,
    sender: mpsc::UnboundedSender<Envelope>,
    log: Arc<Mutex<Vec<Envelope>>>,
    shares: Mutex<Vec<SignalingCall>>,
}

impl BusEndpoint {
    pub fn share_calls(&self) -> Vec<SignalingCall> {
        self.shares.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingChannel for BusEndpoint {
    async fn send_signal(&self, to: ParticipantId, payload: SignalPayload) -> Result<(), MeshError> {
        let envelope = Envelope {
            from: self.local,
            to,
            payload,
        };
        self.log.lock().unwrap().push(envelope.clone());
        self.sender
            .send(envelope)
            .map_err(|e| MeshError::Signaling(format!("bus closed: {e}")))
    }

    async fn start_share(&self, room_id: &RoomId, name: &str) -> Result<(), MeshError> {
        self.shares.lock().unwrap().push(SignalingCall::StartShare {
            room_id: room_id.clone(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn stop_share(&self, room_id: &RoomId) -> Result<(), MeshError> {
        self.shares.lock().unwrap().push(SignalingCall::StopShare {
            room_id: room_id.clone(),
        });
        Ok(())
    }
}

/// `TrackSubstitution` that records substitutions and reports a fixed link
/// count.
pub struct RecordingFanout {
    links: AtomicUsize,
    substitutions: Mutex<Vec<(MediaKind, String)>>,
}

impl RecordingFanout {
    pub fn new(links: usize) -> Arc<Self> {
        Arc::new(Self {
            links: AtomicUsize::new(links),
            substitutions: Mutex::new(Vec::new()),
        })
    }

    /// `(kind, track id)` per substitution, in order.
    pub fn substitutions(&self) -> Vec<(MediaKind, String)> {
        self.substitutions.lock().unwrap().clone()
    }

    /// Id of the last video track substituted.
    pub fn last_video(&self) -> Option<String> {
        self.substitutions()
            .into_iter()
            .rev()
            .find(|(kind, _)| *kind == MediaKind::Video)
            .map(|(_, id)| id)
    }
}

#[async_trait]
impl TrackSubstitution for RecordingFanout {
    async fn replace_outbound(&self, kind: MediaKind, track: SharedTrack) -> Result<usize, MeshError> {
        self.substitutions.lock().unwrap().push((kind, track.id().to_string()));
        Ok(self.links.load(Ordering::SeqCst))
    }
}
