//! `NegotiationEngine` - supervisor of the per-peer actors.
//!
//! The engine owns one `PeerActor` per remote participant, keyed by the
//! unordered `PairKey`. It routes relayed signals to the right actor,
//! creates actors on demand (an offer from a participant we have no actor for
//! starts one), and fans outbound track substitutions out to every link.
//!
//! The engine never awaits a peer actor on its own task: requests are queued
//! with `try_send`, and replies are collected on spawned tasks. A signal for a
//! peer whose mailbox is full is dropped and reported as a protocol anomaly,
//! so one stuck peer cannot stall routing for the others.

use crate::classify::StreamKind;
use crate::config::EngineConfig;
use crate::errors::MeshError;
use crate::link::{LinkSnapshot, LinkState, PairKey};
use crate::media::{MediaKind, OutboundTracks, SharedTrack};
use crate::peer::{PeerActor, PeerActorHandle, PeerMessage, PEER_CHANNEL_BUFFER};
use crate::signaling::{SignalPayload, SignalingChannel};
use crate::tracks::TrackSubstitution;
use crate::transport::TransportFactory;

use async_trait::async_trait;
use common::types::ParticipantId;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the engine mailbox.
const ENGINE_CHANNEL_BUFFER: usize = 500;

/// Time allowed for each peer actor to finish during shutdown.
const PEER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a peer actor needs, shared by all of them.
#[derive(Clone)]
pub struct EngineContext {
    pub local_id: ParticipantId,
    pub config: EngineConfig,
    pub factory: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingChannel>,
    /// Current outbound tracks. `None` until local media is initialized;
    /// links are not built before then.
    pub tracks: watch::Receiver<Option<OutboundTracks>>,
    pub events: mpsc::Sender<EngineEvent>,
}

/// Notifications from the engine and its peer actors.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    LinkStateChanged {
        peer: ParticipantId,
        state: LinkState,
        generation: u64,
    },

    /// Inbound track, classified by its label.
    RemoteTrack {
        peer: ParticipantId,
        track: SharedTrack,
        kind: StreamKind,
    },

    /// The link to `peer` is gone. It is rebuilt only on a later trigger.
    LinkRemoved { peer: ParticipantId, reason: String },

    /// Negotiation failed and the retry budget is spent.
    NegotiationFailed { peer: ParticipantId, reason: String },

    /// A signal that does not fit the current state was dropped.
    ProtocolAnomaly { peer: ParticipantId, detail: String },
}

enum EngineMessage {
    Connect {
        remote: ParticipantId,
        force: bool,
    },
    Signal {
        from: ParticipantId,
        payload: SignalPayload,
    },
    Disconnect {
        remote: ParticipantId,
    },
    ReplaceTrack {
        kind: MediaKind,
        track: SharedTrack,
        respond_to: oneshot::Sender<usize>,
    },
    LinkState {
        remote: ParticipantId,
        respond_to: oneshot::Sender<Option<LinkSnapshot>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<LinkSnapshot>>,
    },
}

/// Handle to the `NegotiationEngine`.
#[derive(Clone, Debug)]
pub struct NegotiationEngineHandle {
    sender: mpsc::Sender<EngineMessage>,
    cancel_token: CancellationToken,
    local_id: ParticipantId,
}

impl NegotiationEngineHandle {
    #[must_use]
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    /// Establish a link to `remote`, offering only if we are the initiator.
    pub async fn connect(&self, remote: ParticipantId) -> Result<(), MeshError> {
        self.send(EngineMessage::Connect { remote, force: false }).await
    }

    /// Offer to `remote` regardless of initiator role.
    pub async fn initiate(&self, remote: ParticipantId) -> Result<(), MeshError> {
        self.send(EngineMessage::Connect { remote, force: true }).await
    }

    /// Route a payload relayed from `from`.
    pub async fn handle_signal(&self, from: ParticipantId, payload: SignalPayload) -> Result<(), MeshError> {
        self.send(EngineMessage::Signal { from, payload }).await
    }

    /// Tear down and forget the link to `remote`.
    pub async fn disconnect(&self, remote: ParticipantId) -> Result<(), MeshError> {
        self.send(EngineMessage::Disconnect { remote }).await
    }

    /// Substitute an outbound track on every live link.
    ///
    /// Returns the number of links whose sender was updated.
    pub async fn replace_track(&self, kind: MediaKind, track: SharedTrack) -> Result<usize, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::ReplaceTrack {
            kind,
            track,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// State of the pair with `remote`, if the engine knows it.
    pub async fn link_state(&self, remote: ParticipantId) -> Result<Option<LinkSnapshot>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::LinkState { remote, respond_to: tx }).await?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// State of every known pair, ordered by remote id.
    pub async fn snapshot(&self) -> Result<Vec<LinkSnapshot>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineMessage::Snapshot { respond_to: tx }).await?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the engine and every peer actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: EngineMessage) -> Result<(), MeshError> {
        if self.cancel_token.is_cancelled() {
            return Err(MeshError::InvalidState("engine stopped".to_string()));
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }
}

#[async_trait]
impl TrackSubstitution for NegotiationEngineHandle {
    async fn replace_outbound(&self, kind: MediaKind, track: SharedTrack) -> Result<usize, MeshError> {
        self.replace_track(kind, track).await
    }
}

struct ManagedPeer {
    remote: ParticipantId,
    handle: PeerActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `NegotiationEngine` implementation.
pub struct NegotiationEngine {
    context: EngineContext,
    receiver: mpsc::Receiver<EngineMessage>,
    cancel_token: CancellationToken,
    peers: HashMap<PairKey, ManagedPeer>,
}

impl NegotiationEngine {
    /// Spawn the engine.
    ///
    /// Cancelling `cancel_token` stops the engine and all of its peer actors.
    pub fn spawn(context: EngineContext, cancel_token: CancellationToken) -> (NegotiationEngineHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ENGINE_CHANNEL_BUFFER);
        let local_id = context.local_id;

        let engine = Self {
            context,
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
        };

        let task_handle = tokio::spawn(engine.run());

        let handle = NegotiationEngineHandle {
            sender,
            cancel_token,
            local_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "mesh.engine", fields(local_id = %self.context.local_id))]
    async fn run(mut self) {
        info!(target: "mesh.engine", local_id = %self.context.local_id, "NegotiationEngine started");

        loop {
            self.check_peer_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "mesh.engine", "NegotiationEngine received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(target: "mesh.engine", "NegotiationEngine channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        self.graceful_shutdown().await;

        info!(target: "mesh.engine", local_id = %self.context.local_id, "NegotiationEngine stopped");
    }

    async fn handle_message(&mut self, message: EngineMessage) {
        match message {
            EngineMessage::Connect { remote, force } => self.handle_connect(remote, force),

            EngineMessage::Signal { from, payload } => self.handle_signal(from, payload),

            EngineMessage::Disconnect { remote } => self.handle_disconnect(remote),

            EngineMessage::ReplaceTrack {
                kind,
                track,
                respond_to,
            } => {
                let handles = self.peer_handles();
                tokio::spawn(async move {
                    let results = join_all(
                        handles
                            .iter()
                            .map(|handle| handle.replace_track(kind, Arc::clone(&track))),
                    )
                    .await;

                    let mut replaced = 0;
                    for result in results {
                        match result {
                            Ok(true) => replaced += 1,
                            Ok(false) => {}
                            Err(e) => {
                                warn!(target: "mesh.engine", kind = %kind, error = %e, "Track substitution failed on a link");
                            }
                        }
                    }
                    let _ = respond_to.send(replaced);
                });
            }

            EngineMessage::LinkState { remote, respond_to } => {
                let key = PairKey::new(self.context.local_id, remote);
                let handle = self.peers.get(&key).map(|managed| managed.handle.clone());
                tokio::spawn(async move {
                    let snapshot = match handle {
                        Some(handle) => handle.snapshot().await.ok(),
                        None => None,
                    };
                    let _ = respond_to.send(snapshot);
                });
            }

            EngineMessage::Snapshot { respond_to } => {
                let handles = self.peer_handles();
                tokio::spawn(async move {
                    let mut snapshots: Vec<LinkSnapshot> =
                        join_all(handles.iter().map(PeerActorHandle::snapshot))
                            .await
                            .into_iter()
                            .filter_map(Result::ok)
                            .collect();
                    snapshots.sort_by_key(|snapshot| snapshot.remote);
                    let _ = respond_to.send(snapshots);
                });
            }
        }
    }

    fn handle_connect(&mut self, remote: ParticipantId, force: bool) {
        if remote == self.context.local_id {
            warn!(target: "mesh.engine", "Ignoring connect to self");
            return;
        }

        let handle = self.peer_for(remote);
        if let Err(e) = handle.try_deliver(PeerMessage::Connect { force }) {
            warn!(target: "mesh.engine", remote_id = %remote, error = %e, "Connect not delivered");
        }
    }

    fn handle_signal(&mut self, from: ParticipantId, payload: SignalPayload) {
        if from == self.context.local_id {
            self.anomaly(from, "signal from self".to_string());
            return;
        }

        let key = PairKey::new(self.context.local_id, from);
        let handle = match self.peers.get(&key) {
            Some(managed) => managed.handle.clone(),
            None if matches!(payload, SignalPayload::Offer { .. }) => {
                debug!(target: "mesh.engine", remote_id = %from, "Offer from new peer");
                self.peer_for(from)
            }
            None => {
                self.anomaly(from, format!("{} for unknown pair", payload.name()));
                return;
            }
        };

        let name = payload.name();
        debug!(target: "mesh.engine", remote_id = %from, payload = name, "Routing signal");
        match handle.try_deliver(PeerMessage::Signal(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.anomaly(from, format!("{name} dropped, peer mailbox full ({PEER_CHANNEL_BUFFER})"));
            }
            Err(TrySendError::Closed(_)) => {
                warn!(target: "mesh.engine", remote_id = %from, payload = name, "Signal not delivered, peer stopped");
            }
        }
    }

    fn handle_disconnect(&mut self, remote: ParticipantId) {
        let key = PairKey::new(self.context.local_id, remote);
        let Some(managed) = self.peers.remove(&key) else {
            debug!(target: "mesh.engine", remote_id = %remote, "Disconnect for unknown pair");
            return;
        };

        info!(target: "mesh.engine", remote_id = %remote, "Disconnecting peer");
        managed.handle.cancel();
        tokio::spawn(reap_peer(managed.remote, managed.task_handle));
    }

    /// Existing actor for `remote`, or a new one.
    fn peer_for(&mut self, remote: ParticipantId) -> PeerActorHandle {
        let key = PairKey::new(self.context.local_id, remote);
        if let Some(managed) = self.peers.get(&key) {
            return managed.handle.clone();
        }

        let (handle, task_handle) =
            PeerActor::spawn(self.context.clone(), remote, self.cancel_token.child_token());
        self.peers.insert(
            key,
            ManagedPeer {
                remote,
                handle: handle.clone(),
                task_handle,
            },
        );

        debug!(
            target: "mesh.engine",
            remote_id = %remote,
            peer_count = self.peers.len(),
            "Peer actor spawned"
        );
        handle
    }

    fn peer_handles(&self) -> Vec<PeerActorHandle> {
        self.peers.values().map(|managed| managed.handle.clone()).collect()
    }

    fn anomaly(&self, peer: ParticipantId, detail: String) {
        warn!(
            target: "mesh.engine",
            remote_id = %peer,
            detail = %detail,
            "Protocol anomaly, signal dropped"
        );
        if let Err(e) = self
            .context
            .events
            .try_send(EngineEvent::ProtocolAnomaly { peer, detail })
        {
            warn!(target: "mesh.engine", error = %e, "Engine event dropped");
        }
    }

    /// Drop actors whose task ended on its own.
    async fn check_peer_health(&mut self) {
        let finished: Vec<PairKey> = self
            .peers
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(key, _)| *key)
            .collect();

        for key in finished {
            let Some(managed) = self.peers.remove(&key) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(target: "mesh.engine", remote_id = %managed.remote, "Peer actor exited");
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "mesh.engine",
                            remote_id = %managed.remote,
                            error = ?join_error,
                            "Peer actor panicked"
                        );
                    }
                }
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "mesh.engine",
            peer_count = self.peers.len(),
            "Performing graceful shutdown"
        );

        for managed in self.peers.values() {
            managed.handle.cancel();
        }

        for (_, managed) in self.peers.drain() {
            match tokio::time::timeout(PEER_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(target: "mesh.engine", remote_id = %managed.remote, "Peer completed cleanly");
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "mesh.engine",
                        remote_id = %managed.remote,
                        error = ?e,
                        "Peer task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(target: "mesh.engine", remote_id = %managed.remote, "Peer shutdown timed out");
                }
            }
        }
    }
}

/// Wait for a cancelled peer task and log a panic if it had one.
async fn reap_peer(remote: ParticipantId, task_handle: JoinHandle<()>) {
    match tokio::time::timeout(PEER_SHUTDOWN_TIMEOUT, task_handle).await {
        Ok(Ok(())) => {
            debug!(target: "mesh.engine", remote_id = %remote, "Peer actor stopped");
        }
        Ok(Err(e)) if e.is_panic() => {
            error!(target: "mesh.engine", remote_id = %remote, error = ?e, "Peer actor panicked");
        }
        Ok(Err(_)) => {}
        Err(_) => {
            warn!(target: "mesh.engine", remote_id = %remote, "Peer actor stop timed out");
        }
    }
}
