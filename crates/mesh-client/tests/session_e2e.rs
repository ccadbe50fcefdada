//! End-to-end tests: sessions talking through a real hub over WebSockets.
//!
//! Media is fake; signaling, room membership and share ownership are real.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::sync::Arc;
use std::time::Duration;

use common::protocol::ShareState;
use common::types::{ParticipantId, RoomId};
use mesh_client::classify::StreamKind;
use mesh_client::config::{EngineConfig, MeshConfig};
use mesh_client::errors::{DeviceError, MeshError};
use mesh_client::hub_client::HubClient;
use mesh_client::link::LinkState;
use mesh_client::media::{MediaKind, MediaTrack};
use mesh_client::session::{JoinedSession, MeshSession, MeshSessionHandle, SessionEvent};
use mesh_client::tracks::ShareOutcome;
use mesh_client::transport::SdpType;
use mesh_test_utils::{eventually, next_matching, FakeDevices, FakeTransportFactory, TestHub, WAIT_TIMEOUT};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ROOM: &str = "standup";

struct Participant {
    id: ParticipantId,
    session: MeshSessionHandle,
    events: mpsc::Receiver<SessionEvent>,
    client: Arc<HubClient>,
    devices: Arc<FakeDevices>,
    factory: Arc<FakeTransportFactory>,
    token: CancellationToken,
}

fn mesh_config(hub: &TestHub) -> MeshConfig {
    MeshConfig {
        hub_url: hub.url(),
        engine: EngineConfig::default(),
    }
}

impl Participant {
    /// Join `ROOM` through the hub with fake media.
    ///
    /// Returns once the hub's `current-peers` has been applied.
    async fn join(hub: &TestHub, name: &str) -> Self {
        let devices = FakeDevices::new();
        let factory = FakeTransportFactory::new();
        let (events_tx, mut events) = mpsc::channel(256);
        let token = CancellationToken::new();

        let JoinedSession { session, client, .. } = MeshSession::join(
            &mesh_config(hub),
            RoomId::from(ROOM),
            name,
            devices.clone(),
            factory.clone(),
            events_tx,
            token.clone(),
        )
        .await
        .unwrap();
        next_matching(&mut events, |event| matches!(event, SessionEvent::ShareChanged(_))).await;

        Self {
            id: client.local_id(),
            session,
            events,
            client,
            devices,
            factory,
            token,
        }
    }

    async fn wait_connected(&self, remote: ParticipantId) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.session.engine().link_state(remote).await.unwrap();
            if snapshot.as_ref().is_some_and(|s| s.state == LinkState::Connected) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{} never connected to {remote}: {snapshot:?}",
                self.id
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_sharing(&self, sharing: bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.session.tracks().state().await.unwrap().sharing != sharing {
            assert!(tokio::time::Instant::now() < deadline, "sharing never became {sharing}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn connected_pair(hub: &TestHub) -> (Participant, Participant) {
    let mut first = Participant::join(hub, "Al").await;
    let mut second = Participant::join(hub, "Bo").await;

    let joined = next_matching(&mut first.events, |event| matches!(event, SessionEvent::PeerJoined { .. })).await;
    assert!(matches!(joined, SessionEvent::PeerJoined { id, ref name } if id == second.id && name == "Bo"));
    let joined = next_matching(&mut second.events, |event| matches!(event, SessionEvent::PeerJoined { .. })).await;
    assert!(matches!(joined, SessionEvent::PeerJoined { id, ref name } if id == first.id && name == "Al"));

    first.wait_connected(second.id).await;
    second.wait_connected(first.id).await;
    (first, second)
}

#[tokio::test]
async fn test_joining_participants_negotiate_once() {
    let hub = TestHub::start().await;
    let (al, bo) = connected_pair(&hub).await;

    let (offerer, answerer) = if al.id < bo.id { (&al, &bo) } else { (&bo, &al) };

    let offered = offerer.factory.latest_for(answerer.id).unwrap();
    let answered = answerer.factory.latest_for(offerer.id).unwrap();
    assert_eq!(offered.local_description().unwrap().sdp_type, SdpType::Offer);
    assert_eq!(answered.remote_description().unwrap(), offered.local_description().unwrap());
    assert_eq!(offered.remote_description().unwrap(), answered.local_description().unwrap());

    assert_eq!(al.factory.created(), 1);
    assert_eq!(bo.factory.created(), 1);

    // Candidates were relayed through the hub and applied.
    assert!(eventually(WAIT_TIMEOUT, || !offered.candidates().is_empty() && !answered.candidates().is_empty()).await);
}

#[tokio::test]
async fn test_screen_share_is_seen_as_shared_stream() {
    let hub = TestHub::start().await;
    let (al, mut bo) = connected_pair(&hub).await;

    assert_eq!(
        al.session.tracks().start_screen_share().await.unwrap(),
        ShareOutcome::Started
    );

    // The screen replaced the camera on the existing link.
    let screen_id = al.devices.last_display().unwrap().id().to_string();
    let video = al.factory.latest_for(bo.id).unwrap().sender(MediaKind::Video).unwrap();
    assert_eq!(video.current_track_id(), screen_id);
    assert_eq!(al.factory.created(), 1);

    // Both sides learn the owner from the hub.
    let owner = ShareState::owned_by(al.id, "Al");
    assert!(eventually(WAIT_TIMEOUT, || al.session.share_state() == owner).await);
    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state() == owner).await);

    // Bo renders Al's video as the shared screen.
    let al_id = al.id;
    next_matching(&mut bo.events, |event| match event {
        SessionEvent::StreamReclassified { peer, kind } => *peer == al_id && *kind == StreamKind::Screen,
        SessionEvent::RemoteStream { peer, kind, .. } => *peer == al_id && *kind == StreamKind::Screen,
        _ => false,
    })
    .await;
}

#[tokio::test]
async fn test_new_share_takes_over_and_previous_sharer_stops() {
    let hub = TestHub::start().await;
    let (al, bo) = connected_pair(&hub).await;

    al.session.tracks().start_screen_share().await.unwrap();
    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state().is_owner(al.id)).await);

    bo.session.tracks().start_screen_share().await.unwrap();

    // Last writer wins; Al yields and goes back to the camera.
    assert!(eventually(WAIT_TIMEOUT, || al.session.share_state().is_owner(bo.id)).await);
    al.wait_sharing(false).await;
    assert!(bo.session.tracks().state().await.unwrap().sharing);

    let camera_id = al.devices.last_camera().unwrap().id().to_string();
    let video = al.factory.latest_for(bo.id).unwrap().sender(MediaKind::Video).unwrap();
    assert!(eventually(WAIT_TIMEOUT, || video.current_track_id() == camera_id).await);

    // Al's yield did not clear Bo's share.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bo.session.share_state().is_owner(bo.id));
    assert!(al.session.share_state().is_owner(bo.id));
}

#[tokio::test]
async fn test_stopping_share_clears_owner_everywhere() {
    let hub = TestHub::start().await;
    let (al, bo) = connected_pair(&hub).await;

    al.session.tracks().start_screen_share().await.unwrap();
    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state().is_owner(al.id)).await);

    assert!(al.session.tracks().stop_screen_share().await.unwrap());

    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state() == ShareState::default()).await);
    assert!(eventually(WAIT_TIMEOUT, || al.session.share_state() == ShareState::default()).await);
}

#[tokio::test]
async fn test_departure_tears_down_link_and_share() {
    let hub = TestHub::start().await;
    let (al, mut bo) = connected_pair(&hub).await;

    al.session.tracks().start_screen_share().await.unwrap();
    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state().is_owner(al.id)).await);
    let bo_transport = bo.factory.latest_for(al.id).unwrap();

    let al_id = al.id;
    al.client.close();

    let left = next_matching(&mut bo.events, |event| matches!(event, SessionEvent::PeerLeft { .. })).await;
    assert!(matches!(left, SessionEvent::PeerLeft { id } if id == al_id));

    assert!(eventually(WAIT_TIMEOUT, || bo.session.share_state() == ShareState::default()).await);
    assert!(eventually(WAIT_TIMEOUT, || bo_transport.is_closed()).await);
    assert!(bo.session.engine().link_state(al_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_chat_and_room_list_reach_the_session() {
    let hub = TestHub::start().await;
    let (al, mut bo) = connected_pair(&hub).await;

    al.client.send_chat(RoomId::from(ROOM), "hello", "Al").await.unwrap();
    let chat = next_matching(&mut bo.events, |event| matches!(event, SessionEvent::Chat { .. })).await;
    match chat {
        SessionEvent::Chat { from, name, text, ts } => {
            assert_eq!(from, al.id);
            assert_eq!(name, "Al");
            assert_eq!(text, "hello");
            assert!(ts > 0);
        }
        other => unreachable!("unexpected event {other:?}"),
    }

    bo.client.get_rooms().await.unwrap();
    let rooms = next_matching(&mut bo.events, |event| matches!(event, SessionEvent::Rooms(_))).await;
    assert!(matches!(rooms, SessionEvent::Rooms(ids) if ids.contains(&RoomId::from(ROOM))));
}

#[tokio::test]
async fn test_hub_shutdown_ends_the_session() {
    let hub = TestHub::start().await;
    let mut al = Participant::join(&hub, "Al").await;

    hub.shutdown();

    next_matching(&mut al.events, |event| matches!(event, SessionEvent::Disconnected)).await;
    assert!(eventually(WAIT_TIMEOUT, || al.client.is_closed()).await);
}

#[tokio::test]
async fn test_join_fails_without_local_media() {
    let hub = TestHub::start().await;
    let al = Participant::join(&hub, "Al").await;

    let devices = FakeDevices::new();
    devices.fail_camera(DeviceError::NotFound("no camera".to_string()));
    let (events_tx, _events) = mpsc::channel(16);

    let result = MeshSession::join(
        &mesh_config(&hub),
        RoomId::from(ROOM),
        "Bo",
        devices,
        FakeTransportFactory::new(),
        events_tx,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(MeshError::Device(DeviceError::NotFound(_)))));

    // Al never learns about a peer that failed to join.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(al.factory.transports().is_empty());
}
