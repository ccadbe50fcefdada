//! `HubClient` against a real hub.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::time::Duration;

use common::protocol::ServerEvent;
use common::types::RoomId;
use mesh_client::errors::MeshError;
use mesh_client::hub_client::HubClient;
use mesh_client::signaling::{SignalPayload, SignalingChannel};
use mesh_client::transport::IceCandidate;
use mesh_test_utils::{next_matching, TestHub};

#[tokio::test]
async fn test_connect_receives_distinct_ids() {
    let hub = TestHub::start().await;

    let (a, _a_events) = HubClient::connect(&hub.url()).await.unwrap();
    let (b, _b_events) = HubClient::connect(&hub.url()).await.unwrap();

    assert_ne!(a.local_id(), b.local_id());
    assert!(!a.is_closed());
}

#[tokio::test]
async fn test_connect_to_unreachable_hub_fails() {
    let hub = TestHub::start().await;
    let url = hub.url();
    drop(hub);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let result = HubClient::connect_with_timeout(&url, Duration::from_millis(500)).await;
    assert!(matches!(result, Err(MeshError::Signaling(_))));
}

#[tokio::test]
async fn test_signals_are_relayed_with_sender_id() {
    let hub = TestHub::start().await;
    let (a, _a_events) = HubClient::connect(&hub.url()).await.unwrap();
    let (b, mut b_events) = HubClient::connect(&hub.url()).await.unwrap();

    let candidate = SignalPayload::Candidate {
        candidate: IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        },
    };
    let offer = SignalPayload::Offer {
        sdp: "v=0".to_string(),
        negotiation: 1,
    };
    a.send_signal(b.local_id(), offer.clone()).await.unwrap();
    a.send_signal(b.local_id(), candidate.clone()).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let event = next_matching(&mut b_events, |event| matches!(event, ServerEvent::Signal { .. })).await;
        if let ServerEvent::Signal { from, payload } = event {
            assert_eq!(from, a.local_id());
            received.push(SignalPayload::from_value(payload).unwrap());
        }
    }
    assert_eq!(received, vec![offer, candidate]);
}

#[tokio::test]
async fn test_join_share_and_leave_round_trip() {
    let hub = TestHub::start().await;
    let (a, mut a_events) = HubClient::connect(&hub.url()).await.unwrap();
    let room = RoomId::from("design");

    a.join_room(room.clone(), "Al").await.unwrap();
    let current = next_matching(&mut a_events, |event| matches!(event, ServerEvent::CurrentPeers { .. })).await;
    assert!(matches!(current, ServerEvent::CurrentPeers { ref room_id, .. } if *room_id == room));

    a.start_share(&room, "Al").await.unwrap();
    let started = next_matching(&mut a_events, |event| matches!(event, ServerEvent::ShareStarted { .. })).await;
    assert!(matches!(started, ServerEvent::ShareStarted { id, .. } if id == a.local_id()));

    a.stop_share(&room).await.unwrap();
    next_matching(&mut a_events, |event| matches!(event, ServerEvent::ShareStopped { .. })).await;

    a.leave_room(room.clone()).await.unwrap();
    a.get_rooms().await.unwrap();
    let rooms = next_matching(&mut a_events, |event| {
        matches!(event, ServerEvent::Rooms { room_ids } if room_ids.is_empty())
    })
    .await;
    assert!(matches!(rooms, ServerEvent::Rooms { .. }));
}

#[tokio::test]
async fn test_closed_client_rejects_sends() {
    let hub = TestHub::start().await;
    let (a, _a_events) = HubClient::connect(&hub.url()).await.unwrap();

    a.close();
    assert!(a.is_closed());
    assert!(matches!(a.get_rooms().await, Err(MeshError::Signaling(_))));
}
