//! `MeshSession` - glue between the hub and the client actors.
//!
//! The session consumes the hub's `ServerEvent`s and drives the negotiation
//! engine and the track controller:
//!
//! | Hub event       | Effect                                               |
//! |-----------------|------------------------------------------------------|
//! | `current-peers` | record share owner, `connect` to every member        |
//! | `peer-joined`   | `connect` to the new member                          |
//! | `peer-left`     | `disconnect` the pair                                |
//! | `signal`        | decode and hand to the engine                        |
//! | `share-started` | record owner; stop our own share if someone else took over |
//! | `share-stopped` | clear owner                                          |
//!
//! Engine events are turned into `SessionEvent`s for the application, with
//! inbound video classified against the room's share owner.

use crate::classify::{classify_remote, StreamKind};
use crate::config::{EngineConfig, MeshConfig};
use crate::engine::{EngineContext, EngineEvent, NegotiationEngine, NegotiationEngineHandle};
use crate::errors::MeshError;
use crate::hub_client::HubClient;
use crate::link::LinkState;
use crate::media::{MediaDevices, MediaKind, SharedTrack};
use crate::signaling::{SignalPayload, SignalingChannel};
use crate::tracks::{TrackContext, TrackController, TrackControllerHandle, TrackSubstitution};
use crate::transport::TransportFactory;

use common::protocol::{ServerEvent, ShareState};
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer between the engine's peer actors and the session.
const ENGINE_EVENT_BUFFER: usize = 256;

/// Time allowed for the engine and track controller to stop.
const CHILD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the session is for.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: RoomId,
    pub display_name: String,
    pub engine: EngineConfig,
}

/// External collaborators of a session.
pub struct SessionDeps {
    /// Id assigned by the hub in `welcome`.
    pub local_id: ParticipantId,
    pub signaling: Arc<dyn SignalingChannel>,
    pub devices: Arc<dyn MediaDevices>,
    pub factory: Arc<dyn TransportFactory>,
    /// Events from the hub, after `welcome`.
    pub server_events: mpsc::Receiver<ServerEvent>,
    /// Where `SessionEvent`s are delivered.
    pub events: mpsc::Sender<SessionEvent>,
}

/// Notifications for the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined {
        id: ParticipantId,
        name: String,
    },
    PeerLeft {
        id: ParticipantId,
    },
    RemoteStream {
        peer: ParticipantId,
        kind: StreamKind,
        track: SharedTrack,
    },
    /// A known inbound video changed role after a share change.
    StreamReclassified {
        peer: ParticipantId,
        kind: StreamKind,
    },
    ShareChanged(ShareState),
    LinkStateChanged {
        peer: ParticipantId,
        state: LinkState,
    },
    LinkRemoved {
        peer: ParticipantId,
        reason: String,
    },
    NegotiationFailed {
        peer: ParticipantId,
        reason: String,
    },
    Rooms(Vec<RoomId>),
    Chat {
        from: ParticipantId,
        name: String,
        text: String,
        ts: i64,
    },
    HubError {
        code: i32,
        message: String,
    },
    /// The hub connection ended.
    Disconnected,
}

/// A session started by [`MeshSession::join`].
pub struct JoinedSession {
    pub session: MeshSessionHandle,
    /// The hub connection the session signals through.
    pub client: Arc<HubClient>,
    pub task: JoinHandle<()>,
}

/// Handle to a running session.
#[derive(Clone, Debug)]
pub struct MeshSessionHandle {
    local_id: ParticipantId,
    room_id: RoomId,
    engine: NegotiationEngineHandle,
    tracks: TrackControllerHandle,
    share: watch::Receiver<ShareState>,
    cancel_token: CancellationToken,
}

impl MeshSessionHandle {
    #[must_use]
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn engine(&self) -> &NegotiationEngineHandle {
        &self.engine
    }

    /// Local media controls.
    #[must_use]
    pub fn tracks(&self) -> &TrackControllerHandle {
        &self.tracks
    }

    /// Share state as last reported by the hub.
    #[must_use]
    pub fn share_state(&self) -> ShareState {
        self.share.borrow().clone()
    }

    /// Stop the session, its engine and its track controller.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// The `MeshSession` implementation.
pub struct MeshSession {
    local_id: ParticipantId,
    room_id: RoomId,
    engine: NegotiationEngineHandle,
    tracks: TrackControllerHandle,
    /// `None` until the first `current-peers`.
    share: Option<ShareState>,
    share_tx: watch::Sender<ShareState>,
    peers: HashMap<ParticipantId, String>,
    remote_video: HashMap<ParticipantId, (SharedTrack, StreamKind)>,
    server_events: mpsc::Receiver<ServerEvent>,
    engine_events: mpsc::Receiver<EngineEvent>,
    events: mpsc::Sender<SessionEvent>,
    cancel_token: CancellationToken,
    engine_task: JoinHandle<()>,
    tracks_task: JoinHandle<()>,
}

impl MeshSession {
    /// Spawn the session together with its engine and track controller.
    ///
    /// The caller joins the room afterwards; the resulting `current-peers`
    /// starts negotiation.
    pub fn spawn(
        config: SessionConfig,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> (MeshSessionHandle, JoinHandle<()>) {
        let cancel_token = cancel_token.child_token();
        let (tracks_tx, tracks_rx) = watch::channel(None);
        let (share_tx, share_rx) = watch::channel(ShareState::default());
        let (engine_events_tx, engine_events) = mpsc::channel(ENGINE_EVENT_BUFFER);

        let (engine, engine_task) = NegotiationEngine::spawn(
            EngineContext {
                local_id: deps.local_id,
                config: config.engine,
                factory: deps.factory,
                signaling: Arc::clone(&deps.signaling),
                tracks: tracks_rx,
                events: engine_events_tx,
            },
            cancel_token.child_token(),
        );

        let fanout: Arc<dyn TrackSubstitution> = Arc::new(engine.clone());
        let (tracks, tracks_task) = TrackController::spawn(
            TrackContext {
                local_id: deps.local_id,
                room_id: config.room_id.clone(),
                display_name: config.display_name,
                devices: deps.devices,
                fanout,
                signaling: deps.signaling,
                tracks: tracks_tx,
                share: share_rx.clone(),
            },
            cancel_token.child_token(),
        );

        let session = Self {
            local_id: deps.local_id,
            room_id: config.room_id.clone(),
            engine: engine.clone(),
            tracks: tracks.clone(),
            share: None,
            share_tx,
            peers: HashMap::new(),
            remote_video: HashMap::new(),
            server_events: deps.server_events,
            engine_events,
            events: deps.events,
            cancel_token: cancel_token.clone(),
            engine_task,
            tracks_task,
        };

        let task_handle = tokio::spawn(session.run());

        let handle = MeshSessionHandle {
            local_id: deps.local_id,
            room_id: config.room_id,
            engine,
            tracks,
            share: share_rx,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Connect to `config.hub_url`, start a session, initialize local media
    /// and join `room_id`.
    ///
    /// On failure after connecting, the session is cancelled and the hub
    /// connection closed.
    pub async fn join(
        config: &MeshConfig,
        room_id: RoomId,
        display_name: &str,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
        events: mpsc::Sender<SessionEvent>,
        cancel_token: CancellationToken,
    ) -> Result<JoinedSession, MeshError> {
        let (client, server_events) = HubClient::connect(&config.hub_url).await?;
        let client = Arc::new(client);
        let signaling: Arc<dyn SignalingChannel> = client.clone();

        let (session, task) = Self::spawn(
            SessionConfig {
                room_id: room_id.clone(),
                display_name: display_name.to_string(),
                engine: config.engine.clone(),
            },
            SessionDeps {
                local_id: client.local_id(),
                signaling,
                devices,
                factory,
                server_events,
                events,
            },
            cancel_token,
        );

        let joined = async {
            session.tracks().init_local_media().await?;
            client.join_room(room_id.clone(), display_name).await
        };
        if let Err(e) = joined.await {
            warn!(target: "mesh.session", room_id = %room_id, error = %e, "Join failed");
            session.cancel();
            client.close();
            return Err(e);
        }

        info!(
            target: "mesh.session",
            local_id = %client.local_id(),
            room_id = %room_id,
            "Joined room"
        );
        Ok(JoinedSession { session, client, task })
    }

    #[instrument(skip_all, name = "mesh.session", fields(local_id = %self.local_id, room_id = %self.room_id))]
    async fn run(mut self) {
        info!(target: "mesh.session", local_id = %self.local_id, room_id = %self.room_id, "MeshSession started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "mesh.session", "MeshSession cancelled");
                    break;
                }

                event = self.server_events.recv() => {
                    match event {
                        Some(event) => self.handle_server_event(event).await,
                        None => {
                            info!(target: "mesh.session", "Hub event stream ended");
                            self.emit(SessionEvent::Disconnected);
                            break;
                        }
                    }
                }

                event = self.engine_events.recv() => {
                    match event {
                        Some(event) => self.handle_engine_event(event),
                        None => break,
                    }
                }
            }
        }

        self.cancel_token.cancel();
        for (name, task) in [("engine", self.engine_task), ("tracks", self.tracks_task)] {
            match tokio::time::timeout(CHILD_SHUTDOWN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(target: "mesh.session", child = name, "Child completed cleanly"),
                Ok(Err(e)) => warn!(target: "mesh.session", child = name, error = ?e, "Child task panicked"),
                Err(_) => warn!(target: "mesh.session", child = name, "Child shutdown timed out"),
            }
        }

        info!(target: "mesh.session", local_id = %self.local_id, "MeshSession stopped");
    }

    async fn handle_server_event(&mut self, event: ServerEvent) {
        debug!(target: "mesh.session", event = event.name(), "Hub event");

        match event {
            ServerEvent::Welcome { id } => {
                if id != self.local_id {
                    warn!(target: "mesh.session", id = %id, "Unexpected welcome for another id");
                }
            }

            ServerEvent::CurrentPeers { room_id, peers, share } => {
                if room_id != self.room_id {
                    return;
                }
                self.set_share(share);
                for peer in peers {
                    if peer.id == self.local_id {
                        continue;
                    }
                    self.add_peer(peer.id, peer.name).await;
                }
            }

            ServerEvent::PeerJoined { room_id, id, name } => {
                if room_id == self.room_id && id != self.local_id {
                    self.add_peer(id, name).await;
                }
            }

            ServerEvent::PeerLeft { room_id, id } => {
                if room_id != self.room_id {
                    return;
                }
                self.peers.remove(&id);
                self.remote_video.remove(&id);
                if let Err(e) = self.engine.disconnect(id).await {
                    warn!(target: "mesh.session", peer_id = %id, error = %e, "Disconnect not delivered");
                }
                self.emit(SessionEvent::PeerLeft { id });
            }

            ServerEvent::Signal { from, payload } => match SignalPayload::from_value(payload) {
                Ok(payload) => {
                    if let Err(e) = self.engine.handle_signal(from, payload).await {
                        warn!(target: "mesh.session", from = %from, error = %e, "Signal not delivered");
                    }
                }
                Err(e) => {
                    warn!(target: "mesh.session", from = %from, error = %e, "Undecodable signal payload");
                }
            },

            ServerEvent::ShareStarted { room_id, id, name } => {
                if room_id != self.room_id {
                    return;
                }
                self.set_share(ShareState::owned_by(id, name));
                if id != self.local_id {
                    self.yield_share(id).await;
                }
            }

            ServerEvent::ShareStopped { room_id } => {
                if room_id == self.room_id {
                    self.set_share(ShareState::default());
                }
            }

            ServerEvent::Rooms { room_ids } => self.emit(SessionEvent::Rooms(room_ids)),

            ServerEvent::ChatMessage {
                room_id,
                from,
                text,
                name,
                ts,
            } => {
                if room_id == self.room_id {
                    self.emit(SessionEvent::Chat { from, name, text, ts });
                }
            }

            ServerEvent::Error { code, message } => {
                warn!(target: "mesh.session", code, message = %message, "Hub reported an error");
                self.emit(SessionEvent::HubError { code, message });
            }
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::RemoteTrack { peer, track, .. } => {
                let kind = classify_remote(peer, track.kind(), track.label(), self.share.as_ref());
                if track.kind() == MediaKind::Video {
                    self.remote_video.insert(peer, (Arc::clone(&track), kind));
                }
                info!(target: "mesh.session", peer_id = %peer, kind = ?kind, "Remote stream");
                self.emit(SessionEvent::RemoteStream { peer, kind, track });
            }

            EngineEvent::LinkStateChanged { peer, state, .. } => {
                self.emit(SessionEvent::LinkStateChanged { peer, state });
            }

            EngineEvent::LinkRemoved { peer, reason } => {
                self.remote_video.remove(&peer);
                self.emit(SessionEvent::LinkRemoved { peer, reason });
            }

            EngineEvent::NegotiationFailed { peer, reason } => {
                warn!(target: "mesh.session", peer_id = %peer, reason = %reason, "Negotiation failed");
                self.emit(SessionEvent::NegotiationFailed { peer, reason });
            }

            EngineEvent::ProtocolAnomaly { peer, detail } => {
                debug!(target: "mesh.session", peer_id = %peer, detail = %detail, "Protocol anomaly");
            }
        }
    }

    async fn add_peer(&mut self, id: ParticipantId, name: String) {
        self.peers.insert(id, name.clone());
        self.emit(SessionEvent::PeerJoined { id, name });
        if let Err(e) = self.engine.connect(id).await {
            warn!(target: "mesh.session", peer_id = %id, error = %e, "Connect not delivered");
        }
    }

    /// Stop our own share after another participant took the room's share.
    async fn yield_share(&self, new_owner: ParticipantId) {
        match self.tracks.state().await {
            Ok(state) if state.sharing => {
                info!(
                    target: "mesh.session",
                    owner_id = %new_owner,
                    "Share taken over by another participant, stopping local share"
                );
                if let Err(e) = self.tracks.stop_screen_share().await {
                    warn!(target: "mesh.session", error = %e, "Failed to stop local share");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(target: "mesh.session", error = %e, "Track controller unavailable"),
        }
    }

    /// Record a new share state and reclassify known inbound video.
    fn set_share(&mut self, share: ShareState) {
        self.share_tx.send_replace(share.clone());

        let mut changed = Vec::new();
        for (peer, (track, kind)) in &mut self.remote_video {
            let updated = classify_remote(*peer, MediaKind::Video, track.label(), Some(&share));
            if updated != *kind {
                *kind = updated;
                changed.push((*peer, updated));
            }
        }

        self.share = Some(share.clone());
        self.emit(SessionEvent::ShareChanged(share));
        for (peer, kind) in changed {
            self.emit(SessionEvent::StreamReclassified { peer, kind });
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(target: "mesh.session", error = %e, "Session event dropped");
        }
    }
}
