//! Per-pair link records.
//!
//! A `PeerLink` is the explicit state of one transport between the local
//! participant and one remote: its negotiation state, its generation, the
//! senders for the outbound tracks and any candidates that arrived before the
//! remote description. It is owned by exactly one `PeerActor`.

use crate::media::MediaKind;
use crate::transport::{IceCandidate, PeerTransport, TrackSender};

use common::types::ParticipantId;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Unordered pair of participants, stored smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: ParticipantId,
    high: ParticipantId,
}

impl PairKey {
    #[must_use]
    pub fn new(a: ParticipantId, b: ParticipantId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    #[must_use]
    pub fn low(&self) -> ParticipantId {
        self.low
    }

    #[must_use]
    pub fn high(&self) -> ParticipantId {
        self.high
    }

    /// The participant that offers when a link is established by `connect`.
    ///
    /// Both ends compute the same answer without coordination.
    #[must_use]
    pub fn initiator(&self) -> ParticipantId {
        self.low
    }

    /// The member of the pair that is not `id`.
    #[must_use]
    pub fn other(&self, id: ParticipantId) -> ParticipantId {
        if id == self.low {
            self.high
        } else {
            self.low
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// Negotiation state of a link.
///
/// `Idle` is only observed before the first link for a pair exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Local offer sent, waiting for the answer.
    Offering,
    /// Remote offer being answered.
    Offered,
    /// Offer/answer exchange complete.
    Connected,
    Closed,
    Failed,
}

impl LinkState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Closed | LinkState::Failed)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Offered => "offered",
            LinkState::Connected => "connected",
            LinkState::Closed => "closed",
            LinkState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub remote: ParticipantId,
    pub state: LinkState,
    /// Generation of the current link, or of the last one if torn down.
    pub generation: u64,
    pub buffered_candidates: usize,
    pub retries: u32,
}

/// Live link to one remote participant.
pub struct PeerLink {
    remote: ParticipantId,
    generation: u64,
    state: LinkState,
    transport: Arc<dyn PeerTransport>,
    audio_sender: Arc<dyn TrackSender>,
    video_sender: Arc<dyn TrackSender>,
    remote_description_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
    candidate_limit: usize,
    /// Forwards transport events into the owning actor's mailbox.
    forwarder: JoinHandle<()>,
}

impl PeerLink {
    /// Wrap a freshly created transport with both outbound tracks attached.
    #[must_use]
    pub fn new(
        remote: ParticipantId,
        generation: u64,
        transport: Arc<dyn PeerTransport>,
        audio_sender: Arc<dyn TrackSender>,
        video_sender: Arc<dyn TrackSender>,
        forwarder: JoinHandle<()>,
        candidate_limit: usize,
    ) -> Self {
        Self {
            remote,
            generation,
            state: LinkState::Idle,
            transport,
            audio_sender,
            video_sender,
            remote_description_applied: false,
            pending_candidates: VecDeque::new(),
            candidate_limit: candidate_limit.max(1),
            forwarder,
        }
    }

    #[must_use]
    pub fn remote(&self) -> ParticipantId {
        self.remote
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn set_state(&mut self, state: LinkState) {
        self.state = state;
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.transport)
    }

    #[must_use]
    pub fn sender(&self, kind: MediaKind) -> Arc<dyn TrackSender> {
        match kind {
            MediaKind::Audio => Arc::clone(&self.audio_sender),
            MediaKind::Video => Arc::clone(&self.video_sender),
        }
    }

    #[must_use]
    pub fn remote_description_applied(&self) -> bool {
        self.remote_description_applied
    }

    /// Record that the remote description is set and hand back the
    /// candidates that were waiting for it, oldest first.
    pub fn mark_remote_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_applied = true;
        self.pending_candidates.drain(..).collect()
    }

    /// Hold a candidate until the remote description is applied.
    ///
    /// Returns the candidate evicted to make room, if any.
    pub fn buffer_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        let evicted = if self.pending_candidates.len() >= self.candidate_limit {
            self.pending_candidates.pop_front()
        } else {
            None
        };
        self.pending_candidates.push_back(candidate);
        evicted
    }

    #[must_use]
    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    #[must_use]
    pub fn snapshot(&self, retries: u32) -> LinkSnapshot {
        LinkSnapshot {
            remote: self.remote,
            state: self.state,
            generation: self.generation,
            buffered_candidates: self.pending_candidates.len(),
            retries,
        }
    }

    /// Stop event forwarding and close the transport.
    pub async fn close(self) {
        self.forwarder.abort();
        self.transport.close().await;
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", &self.remote)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("remote_description_applied", &self.remote_description_applied)
            .field("pending_candidates", &self.pending_candidates.len())
            .finish_non_exhaustive()
    }
}
