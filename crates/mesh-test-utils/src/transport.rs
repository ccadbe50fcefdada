//! Fake peer transports.
//!
//! A `FakeTransport` accepts any description, emits one local candidate per
//! `set_local_description`, reports `Connected` once both descriptions are
//! set and, unless disabled on the factory, then delivers one remote audio
//! and one remote video track.

use crate::media::FakeTrack;

use async_trait::async_trait;
use common::types::ParticipantId;
use mesh_client::errors::{NegotiationError, TransportError};
use mesh_client::media::{MediaKind, SharedTrack};
use mesh_client::transport::{
    ConnectionState, IceCandidate, PeerTransport, SessionDescription, TrackSender, TransportEvent,
    TransportFactory,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

const TRANSPORT_EVENT_BUFFER: usize = 64;

/// Sender that records every track it carried.
pub struct FakeSender {
    kind: MediaKind,
    history: Mutex<Vec<String>>,
}

impl FakeSender {
    fn new(track: &SharedTrack) -> Self {
        Self {
            kind: track.kind(),
            history: Mutex::new(vec![track.id().to_string()]),
        }
    }

    /// Id of the track currently sent.
    pub fn current_track_id(&self) -> String {
        self.history.lock().unwrap().last().cloned().unwrap_or_default()
    }

    /// Every track id carried, initial track first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub fn replacements(&self) -> usize {
        self.history.lock().unwrap().len().saturating_sub(1)
    }
}

#[async_trait]
impl TrackSender for FakeSender {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: SharedTrack) -> Result<(), TransportError> {
        if track.kind() != self.kind {
            return Err(TransportError::ReplaceTrack(format!(
                "cannot send {} on a {} sender",
                track.kind(),
                self.kind
            )));
        }
        self.history.lock().unwrap().push(track.id().to_string());
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    senders: Vec<Arc<FakeSender>>,
    connected: bool,
    closed: bool,
}

pub struct FakeTransport {
    id: usize,
    remote: ParticipantId,
    ice_servers: Vec<String>,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<TransportState>,
    offer_failures: Arc<AtomicU32>,
    remote_tracks: bool,
}

impl FakeTransport {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    pub fn ice_servers(&self) -> Vec<String> {
        self.ice_servers.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    /// Remote candidates applied so far.
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().candidates.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub fn sender(&self, kind: MediaKind) -> Option<Arc<FakeSender>> {
        self.state
            .lock()
            .unwrap()
            .senders
            .iter()
            .find(|sender| sender.kind == kind)
            .cloned()
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().unwrap().senders.len()
    }

    /// Inject a transport event as if the media stack raised it.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.try_send(event);
    }

    pub fn fail(&self) {
        self.emit(TransportEvent::StateChanged(ConnectionState::Failed));
    }

    fn maybe_connect(&self) {
        let mut state = self.state.lock().unwrap();
        if state.connected || state.closed || state.local.is_none() || state.remote.is_none() {
            return;
        }
        state.connected = true;
        drop(state);

        self.emit(TransportEvent::StateChanged(ConnectionState::Connected));
        if self.remote_tracks {
            let audio = FakeTrack::microphone(format!("remote-audio-{}", self.id));
            let video = FakeTrack::new(format!("remote-video-{}", self.id), MediaKind::Video, "remote video");
            self.emit(TransportEvent::RemoteTrack(audio));
            self.emit(TransportEvent::RemoteTrack(video));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: SharedTrack) -> Result<Arc<dyn TrackSender>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let sender = Arc::new(FakeSender::new(&track));
        state.senders.push(Arc::clone(&sender));
        Ok(sender as Arc<dyn TrackSender>)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let injected = self
            .offer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(NegotiationError::CreateOffer("injected failure".to_string()));
        }
        Ok(SessionDescription::offer(format!("offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.state.lock().unwrap().remote.is_none() {
            return Err(NegotiationError::CreateAnswer("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-{}", self.id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(NegotiationError::SetLocalDescription("transport closed".to_string()));
            }
            state.local = Some(description);
        }

        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 50000 typ host", self.id, self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), NegotiationError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(NegotiationError::SetRemoteDescription("transport closed".to_string()));
            }
            state.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(TransportError::Candidate("no remote description".to_string()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().unwrap().closed = true;
    }
}

#[derive(Default)]
struct FactoryInner {
    created: Vec<Arc<FakeTransport>>,
    held: HashSet<ParticipantId>,
}

/// Factory handing out `FakeTransport`s and remembering every one of them.
pub struct FakeTransportFactory {
    inner: Mutex<FactoryInner>,
    offer_failures: Arc<AtomicU32>,
    remote_tracks: AtomicBool,
    released: Notify,
}

impl FakeTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FactoryInner::default()),
            offer_failures: Arc::new(AtomicU32::new(0)),
            remote_tracks: AtomicBool::new(true),
            released: Notify::new(),
        })
    }

    /// Make `create` for `remote` wait until `release` is called.
    pub fn hold(&self, remote: ParticipantId) {
        self.inner.lock().unwrap().held.insert(remote);
    }

    pub fn release(&self, remote: ParticipantId) {
        self.inner.lock().unwrap().held.remove(&remote);
        self.released.notify_waiters();
    }

    /// Make the next `count` `create_offer` calls fail, on any transport.
    pub fn fail_next_offers(&self, count: u32) {
        self.offer_failures.store(count, Ordering::SeqCst);
    }

    /// Whether transports created from now on deliver remote tracks.
    pub fn set_remote_tracks(&self, enabled: bool) {
        self.remote_tracks.store(enabled, Ordering::SeqCst);
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.inner.lock().unwrap().created.clone()
    }

    /// Transports built for `remote`, oldest first.
    pub fn transports_for(&self, remote: ParticipantId) -> Vec<Arc<FakeTransport>> {
        self.inner
            .lock()
            .unwrap()
            .created
            .iter()
            .filter(|transport| transport.remote == remote)
            .cloned()
            .collect()
    }

    pub fn latest_for(&self, remote: ParticipantId) -> Option<Arc<FakeTransport>> {
        self.transports_for(remote).pop()
    }

    pub fn created(&self) -> usize {
        self.inner.lock().unwrap().created.len()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        remote: ParticipantId,
        ice_servers: &[String],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<TransportEvent>), TransportError> {
        loop {
            let released = self.released.notified();
            let held = self.inner.lock().unwrap().held.contains(&remote);
            if !held {
                break;
            }
            released.await;
        }

        let (events, receiver) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let mut inner = self.inner.lock().unwrap();

        let transport = Arc::new(FakeTransport {
            id: inner.created.len() + 1,
            remote,
            ice_servers: ice_servers.to_vec(),
            events,
            state: Mutex::new(TransportState::default()),
            offer_failures: Arc::clone(&self.offer_failures),
            remote_tracks: self.remote_tracks.load(Ordering::SeqCst),
        });
        inner.created.push(Arc::clone(&transport));

        Ok((transport as Arc<dyn PeerTransport>, receiver))
    }
}
