//! `PeerActor` - negotiation with one remote participant.
//!
//! Each remote participant gets its own actor, so a slow or failing peer never
//! delays another. Everything that touches the pair's link goes through this
//! actor's mailbox:
//!
//! - `connect` / `initiate` requests from the engine
//! - relayed `signal` payloads (offer, answer, candidate)
//! - transport events (local candidates, connection state, inbound tracks)
//! - answer timeouts and retries scheduled by the actor itself
//! - outbound track substitution
//!
//! # Generations
//!
//! Every link gets a new generation number. Transport events and answer
//! timeouts carry the generation they were produced for; retries carry the
//! generation the next link would get. Anything whose generation no longer
//! matches is ignored.
//!
//! Offers carry the offerer's generation as their negotiation id and answers
//! echo it, so an answer to an offer that was since replaced by a retry is
//! dropped instead of completing the newer link.
//!
//! # Glare
//!
//! Both ends derive the same initiator from the pair (smaller id). When an
//! offer arrives while we are `Offering`, the initiator keeps its own offer and
//! the other side yields and answers.

use crate::classify::classify_by_label;
use crate::engine::{EngineContext, EngineEvent};
use crate::errors::{MeshError, NegotiationError};
use crate::link::{LinkSnapshot, LinkState, PairKey, PeerLink};
use crate::media::{MediaKind, OutboundTracks, SharedTrack};
use crate::signaling::SignalPayload;
use crate::transport::{ConnectionState, IceCandidate, PeerTransport, SessionDescription, TransportEvent};

use common::types::ParticipantId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Mailbox size for each peer actor.
pub(crate) const PEER_CHANNEL_BUFFER: usize = 256;

/// Messages handled by a `PeerActor`.
pub(crate) enum PeerMessage {
    /// Establish a link. `force` offers regardless of initiator role.
    Connect { force: bool },

    /// Payload relayed from the remote participant.
    Signal(SignalPayload),

    Transport { generation: u64, event: TransportEvent },

    AnswerTimeout { generation: u64 },

    /// `epoch` is the generation the retried link will get.
    Retry { epoch: u64, action: RetryAction },

    /// Swap an outbound track on the live link. Replies `true` if a sender
    /// was updated.
    ReplaceTrack {
        kind: MediaKind,
        track: SharedTrack,
        respond_to: oneshot::Sender<Result<bool, MeshError>>,
    },

    GetSnapshot { respond_to: oneshot::Sender<LinkSnapshot> },
}

/// Negotiation step to repeat after a failure.
#[derive(Debug, Clone)]
pub(crate) enum RetryAction {
    Offer,
    Answer { sdp: String, negotiation: u64 },
}

/// Handle to a `PeerActor`.
#[derive(Clone, Debug)]
pub(crate) struct PeerActorHandle {
    sender: mpsc::Sender<PeerMessage>,
    cancel_token: CancellationToken,
}

impl PeerActorHandle {
    /// Queue `message` without waiting for mailbox space.
    pub(crate) fn try_deliver(&self, message: PeerMessage) -> Result<(), TrySendError<PeerMessage>> {
        self.sender.try_send(message)
    }

    pub(crate) async fn replace_track(&self, kind: MediaKind, track: SharedTrack) -> Result<bool, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerMessage::ReplaceTrack {
            kind,
            track,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    pub(crate) async fn snapshot(&self) -> Result<LinkSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(PeerMessage::GetSnapshot { respond_to: tx }).await?;

        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop the actor. Its link is torn down before it exits.
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn send(&self, message: PeerMessage) -> Result<(), MeshError> {
        if self.cancel_token.is_cancelled() {
            return Err(MeshError::InvalidState("peer actor stopped".to_string()));
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }
}

/// The `PeerActor` implementation.
pub(crate) struct PeerActor {
    local_id: ParticipantId,
    remote_id: ParticipantId,
    pair: PairKey,
    context: EngineContext,
    receiver: mpsc::Receiver<PeerMessage>,
    /// Used by timers and transport forwarders; does not keep the mailbox open.
    mailbox: mpsc::WeakSender<PeerMessage>,
    cancel_token: CancellationToken,
    link: Option<PeerLink>,
    next_generation: u64,
    /// Reported while there is no live link.
    idle_state: LinkState,
    last_generation: u64,
    /// Retries spent since the last explicit trigger.
    retries: u32,
}

impl PeerActor {
    /// Spawn the actor for `remote`.
    pub(crate) fn spawn(
        context: EngineContext,
        remote_id: ParticipantId,
        cancel_token: CancellationToken,
    ) -> (PeerActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(PEER_CHANNEL_BUFFER);

        let actor = Self {
            local_id: context.local_id,
            remote_id,
            pair: PairKey::new(context.local_id, remote_id),
            context,
            receiver,
            mailbox: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            link: None,
            next_generation: 1,
            idle_state: LinkState::Idle,
            last_generation: 0,
            retries: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        (PeerActorHandle { sender, cancel_token }, task_handle)
    }

    #[instrument(skip_all, name = "mesh.peer", fields(local_id = %self.local_id, remote_id = %self.remote_id))]
    async fn run(mut self) {
        debug!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            initiator = self.is_initiator(),
            "PeerActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "mesh.peer", remote_id = %self.remote_id, "PeerActor cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            debug!(target: "mesh.peer", remote_id = %self.remote_id, "PeerActor channel closed");
                            break;
                        }
                    }
                }
            }
        }

        if self.teardown(LinkState::Closed).await {
            self.emit(EngineEvent::LinkRemoved {
                peer: self.remote_id,
                reason: "disconnected".to_string(),
            });
        }

        debug!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            links_created = self.next_generation.saturating_sub(1),
            "PeerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: PeerMessage) {
        match message {
            PeerMessage::Connect { force } => self.handle_connect(force).await,

            PeerMessage::Signal(payload) => match payload {
                SignalPayload::Offer { sdp, negotiation } => self.handle_offer(sdp, negotiation).await,
                SignalPayload::Answer { sdp, negotiation } => self.handle_answer(sdp, negotiation).await,
                SignalPayload::Candidate { candidate } => self.handle_candidate(candidate).await,
            },

            PeerMessage::Transport { generation, event } => {
                self.handle_transport_event(generation, event).await;
            }

            PeerMessage::AnswerTimeout { generation } => self.handle_answer_timeout(generation).await,

            PeerMessage::Retry { epoch, action } => self.handle_retry(epoch, action).await,

            PeerMessage::ReplaceTrack {
                kind,
                track,
                respond_to,
            } => {
                let result = self.handle_replace_track(kind, track).await;
                let _ = respond_to.send(result);
            }

            PeerMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    fn is_initiator(&self) -> bool {
        self.pair.initiator() == self.local_id
    }

    fn current_state(&self) -> LinkState {
        self.link.as_ref().map_or(self.idle_state, PeerLink::state)
    }

    fn snapshot(&self) -> LinkSnapshot {
        match &self.link {
            Some(link) => link.snapshot(self.retries),
            None => LinkSnapshot {
                remote: self.remote_id,
                state: self.idle_state,
                generation: self.last_generation,
                buffered_candidates: 0,
                retries: self.retries,
            },
        }
    }

    async fn handle_connect(&mut self, force: bool) {
        if !force && !self.is_initiator() {
            debug!(target: "mesh.peer", remote_id = %self.remote_id, "Waiting for remote offer");
            return;
        }
        if !force && self.link.is_some() {
            debug!(
                target: "mesh.peer",
                remote_id = %self.remote_id,
                state = %self.current_state(),
                "Link already active"
            );
            return;
        }

        self.retries = 0;
        self.start_offer().await;
    }

    async fn handle_offer(&mut self, sdp: String, negotiation: u64) {
        match self.current_state() {
            LinkState::Offering if self.is_initiator() => {
                info!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    "Glare: keeping local offer, ignoring remote offer"
                );
                return;
            }
            LinkState::Offering => {
                info!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    "Glare: yielding to remote offer"
                );
            }
            LinkState::Offered | LinkState::Connected => {
                info!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    "Remote re-derived link, answering on a fresh link"
                );
            }
            LinkState::Idle | LinkState::Closed | LinkState::Failed => {}
        }

        self.retries = 0;
        self.start_answer(sdp, negotiation).await;
    }

    async fn start_offer(&mut self) {
        if let Err(e) = self.try_offer().await {
            self.on_negotiation_error(RetryAction::Offer, e).await;
        }
    }

    async fn try_offer(&mut self) -> Result<(), MeshError> {
        let transport = self.open_link().await?;
        self.set_link_state(LinkState::Offering);

        let generation = self.last_generation;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.context
            .signaling
            .send_signal(self.remote_id, SignalPayload::from_description(offer, generation))
            .await?;

        self.schedule(self.context.config.answer_timeout, PeerMessage::AnswerTimeout { generation });

        debug!(target: "mesh.peer", remote_id = %self.remote_id, generation, "Offer sent");
        Ok(())
    }

    async fn start_answer(&mut self, sdp: String, negotiation: u64) {
        if let Err(e) = self.try_answer(sdp.clone(), negotiation).await {
            self.on_negotiation_error(RetryAction::Answer { sdp, negotiation }, e).await;
        }
    }

    async fn try_answer(&mut self, sdp: String, negotiation: u64) -> Result<(), MeshError> {
        let transport = self.open_link().await?;
        self.set_link_state(LinkState::Offered);

        transport.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.replay_candidates(&transport).await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.context
            .signaling
            .send_signal(self.remote_id, SignalPayload::from_description(answer, negotiation))
            .await?;

        self.set_link_state(LinkState::Connected);
        debug!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            generation = self.last_generation,
            negotiation,
            "Answer sent"
        );
        Ok(())
    }

    async fn handle_answer(&mut self, sdp: String, negotiation: u64) {
        let Some(link) = self.link.as_ref().filter(|link| link.state() == LinkState::Offering) else {
            self.anomaly(format!("answer received in state {}", self.current_state()));
            return;
        };
        if link.generation() != negotiation {
            debug!(
                target: "mesh.peer",
                remote_id = %self.remote_id,
                generation = link.generation(),
                negotiation,
                "Stale answer ignored"
            );
            return;
        }
        let transport = link.transport();

        if let Err(e) = transport.set_remote_description(SessionDescription::answer(sdp)).await {
            self.on_negotiation_error(RetryAction::Offer, e.into()).await;
            return;
        }
        self.replay_candidates(&transport).await;

        self.set_link_state(LinkState::Connected);
        self.retries = 0;
        debug!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            generation = self.last_generation,
            "Answer applied"
        );
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if self.link.is_none() {
            self.anomaly("candidate received without a link".to_string());
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        if link.remote_description_applied() {
            let transport = link.transport();
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!(target: "mesh.peer", remote_id = %self.remote_id, error = %e, "Candidate rejected");
            }
        } else if let Some(evicted) = link.buffer_candidate(candidate) {
            warn!(
                target: "mesh.peer",
                remote_id = %self.remote_id,
                evicted = %evicted.candidate,
                "Candidate buffer full, dropped oldest"
            );
        }
    }

    /// Apply candidates that arrived before the remote description.
    async fn replay_candidates(&mut self, transport: &Arc<dyn PeerTransport>) {
        let pending = self
            .link
            .as_mut()
            .map(PeerLink::mark_remote_applied)
            .unwrap_or_default();

        if !pending.is_empty() {
            debug!(
                target: "mesh.peer",
                remote_id = %self.remote_id,
                count = pending.len(),
                "Replaying buffered candidates"
            );
        }

        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                debug!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    error = %e,
                    "Buffered candidate rejected"
                );
            }
        }
    }

    async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if self.link.as_ref().map(PeerLink::generation) != Some(generation) {
            debug!(
                target: "mesh.peer",
                remote_id = %self.remote_id,
                generation,
                "Stale transport event ignored"
            );
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let payload = SignalPayload::Candidate { candidate };
                if let Err(e) = self.context.signaling.send_signal(self.remote_id, payload).await {
                    warn!(target: "mesh.peer", remote_id = %self.remote_id, error = %e, "Failed to send candidate");
                }
            }

            TransportEvent::StateChanged(ConnectionState::Connected) => {
                info!(target: "mesh.peer", remote_id = %self.remote_id, generation, "Transport connected");
                self.retries = 0;
            }

            TransportEvent::StateChanged(state) if state.is_terminal() => {
                warn!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    generation,
                    state = %state,
                    "Transport lost, removing link"
                );
                let final_state = if state == ConnectionState::Closed {
                    LinkState::Closed
                } else {
                    LinkState::Failed
                };
                self.teardown(final_state).await;
                self.emit(EngineEvent::LinkRemoved {
                    peer: self.remote_id,
                    reason: state.to_string(),
                });
            }

            TransportEvent::StateChanged(state) => {
                debug!(target: "mesh.peer", remote_id = %self.remote_id, state = %state, "Transport state");
            }

            TransportEvent::RemoteTrack(track) => {
                let kind = classify_by_label(track.kind(), track.label());
                debug!(
                    target: "mesh.peer",
                    remote_id = %self.remote_id,
                    track_id = track.id(),
                    kind = ?kind,
                    "Remote track"
                );
                self.emit(EngineEvent::RemoteTrack {
                    peer: self.remote_id,
                    track,
                    kind,
                });
            }
        }
    }

    async fn handle_answer_timeout(&mut self, generation: u64) {
        let waiting = self
            .link
            .as_ref()
            .is_some_and(|link| link.generation() == generation && link.state() == LinkState::Offering);
        if !waiting {
            return;
        }

        let timeout_ms = u64::try_from(self.context.config.answer_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            generation,
            timeout_ms,
            "No answer received"
        );
        self.on_negotiation_error(RetryAction::Offer, NegotiationError::AnswerTimeout(timeout_ms).into())
            .await;
    }

    async fn handle_retry(&mut self, epoch: u64, action: RetryAction) {
        if epoch != self.next_generation || self.link.is_some() {
            debug!(target: "mesh.peer", remote_id = %self.remote_id, epoch, "Stale retry ignored");
            return;
        }

        info!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            attempt = self.retries,
            "Retrying negotiation"
        );

        match action {
            RetryAction::Offer => self.start_offer().await,
            RetryAction::Answer { sdp, negotiation } => self.start_answer(sdp, negotiation).await,
        }
    }

    async fn handle_replace_track(&mut self, kind: MediaKind, track: SharedTrack) -> Result<bool, MeshError> {
        let Some(link) = self.link.as_ref() else {
            return Ok(false);
        };

        link.sender(kind).replace_track(track).await?;
        Ok(true)
    }

    /// Tear the failed link down and either schedule a retry or surface the
    /// failure.
    async fn on_negotiation_error(&mut self, action: RetryAction, error: MeshError) {
        warn!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            error = %error,
            retries = self.retries,
            "Negotiation step failed"
        );

        self.teardown(LinkState::Failed).await;

        if self.cancel_token.is_cancelled() {
            return;
        }

        if self.retries < self.context.config.retry_limit {
            self.retries += 1;
            let epoch = self.next_generation;
            self.schedule(self.context.config.retry_delay, PeerMessage::Retry { epoch, action });
        } else {
            self.retries = 0;
            self.emit(EngineEvent::NegotiationFailed {
                peer: self.remote_id,
                reason: error.to_string(),
            });
        }
    }

    /// Replace any current link with a fresh transport carrying the current
    /// outbound tracks. Waits until local media exists.
    async fn open_link(&mut self) -> Result<Arc<dyn PeerTransport>, MeshError> {
        self.teardown(LinkState::Closed).await;

        let tracks = self.wait_for_tracks().await.ok_or(NegotiationError::TracksUnavailable)?;

        let generation = self.next_generation;
        self.next_generation += 1;
        self.last_generation = generation;

        let (transport, events) = self
            .context
            .factory
            .create(self.remote_id, &self.context.config.ice_servers)
            .await?;

        let senders = match transport.add_track(Arc::clone(&tracks.audio)).await {
            Ok(audio) => transport
                .add_track(Arc::clone(&tracks.video))
                .await
                .map(|video| (audio, video)),
            Err(e) => Err(e),
        };
        let (audio_sender, video_sender) = match senders {
            Ok(senders) => senders,
            Err(e) => {
                transport.close().await;
                return Err(e.into());
            }
        };

        let forwarder = tokio::spawn(forward_transport_events(generation, events, self.mailbox.clone()));

        self.link = Some(PeerLink::new(
            self.remote_id,
            generation,
            Arc::clone(&transport),
            audio_sender,
            video_sender,
            forwarder,
            self.context.config.candidate_buffer,
        ));

        debug!(target: "mesh.peer", remote_id = %self.remote_id, generation, "Link created");
        Ok(transport)
    }

    async fn wait_for_tracks(&self) -> Option<OutboundTracks> {
        let mut tracks = self.context.tracks.clone();
        tokio::select! {
            () = self.cancel_token.cancelled() => None,
            result = tracks.wait_for(|current| current.is_some()) => result.ok().and_then(|current| current.clone()),
        }
    }

    /// Close and forget the live link, if any. Returns whether one existed.
    async fn teardown(&mut self, final_state: LinkState) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        let generation = link.generation();
        link.close().await;

        self.idle_state = final_state;
        debug!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            generation,
            state = %final_state,
            "Link torn down"
        );
        self.emit(EngineEvent::LinkStateChanged {
            peer: self.remote_id,
            state: final_state,
            generation,
        });
        true
    }

    fn set_link_state(&mut self, state: LinkState) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.set_state(state);
        let generation = link.generation();

        self.emit(EngineEvent::LinkStateChanged {
            peer: self.remote_id,
            state,
            generation,
        });
    }

    fn anomaly(&self, detail: String) {
        warn!(
            target: "mesh.peer",
            remote_id = %self.remote_id,
            detail = %detail,
            "Protocol anomaly, message dropped"
        );
        self.emit(EngineEvent::ProtocolAnomaly {
            peer: self.remote_id,
            detail,
        });
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.context.events.try_send(event) {
            warn!(target: "mesh.peer", remote_id = %self.remote_id, error = %e, "Engine event dropped");
        }
    }

    /// Deliver `message` to this actor after `delay` unless it stops first.
    fn schedule(&self, delay: Duration, message: PeerMessage) {
        let mailbox = self.mailbox.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    if let Some(sender) = mailbox.upgrade() {
                        let _ = sender.send(message).await;
                    }
                }
            }
        });
    }
}

/// Move one transport's events into the owning actor's mailbox.
async fn forward_transport_events(
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    mailbox: mpsc::WeakSender<PeerMessage>,
) {
    while let Some(event) = events.recv().await {
        let Some(sender) = mailbox.upgrade() else {
            break;
        };
        if sender.send(PeerMessage::Transport { generation, event }).await.is_err() {
            break;
        }
    }
}
