//! End-to-end tests for the hub over real WebSockets.
//!
//! Each test starts the hub router on an ephemeral port and talks to it with
//! `tokio-tungstenite` clients.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::net::SocketAddr;
use std::time::Duration;

use common::protocol::{ClientEvent, PeerInfo, ServerEvent, ShareState};
use common::types::{ParticipantId, RoomId};
use futures_util::{SinkExt, StreamExt};
use hub_service::actors::{ActorMetrics, HubActor, HubActorHandle};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

struct TestHub {
    addr: SocketAddr,
    handle: HubActorHandle,
    token: CancellationToken,
}

impl TestHub {
    async fn start() -> Self {
        let token = CancellationToken::new();
        let (handle, _task) = HubActor::spawn("hub-e2e".to_string(), token.clone(), 64, ActorMetrics::new());

        let app = hub_service::ws::router(handle.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_token = token.child_token();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_token.cancelled().await })
                .await
                .unwrap();
        });

        Self { addr, handle, token }
    }

    async fn client(&self) -> Client {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.addr)).await.unwrap();
        let mut client = Client { socket, id: ParticipantId::new() };
        match client.recv().await {
            ServerEvent::Welcome { id } => client.id = id,
            other => unreachable!("expected welcome, got {other:?}"),
        }
        client
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Client {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: ParticipantId,
}

impl Client {
    async fn send(&mut self, event: &ClientEvent) {
        self.send_raw(&event.to_json().unwrap()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.socket.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn recv(&mut self) -> ServerEvent {
        loop {
            let frame = tokio::time::timeout(EVENT_TIMEOUT, self.socket.next())
                .await
                .expect("timed out waiting for event")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return ServerEvent::from_json(&text).unwrap();
            }
        }
    }

    async fn close(mut self) {
        self.socket.close(None).await.unwrap();
    }
}

fn room(name: &str) -> RoomId {
    RoomId::from(name)
}

fn join(name: &str, display: &str) -> ClientEvent {
    ClientEvent::JoinRoom {
        room_id: room(name),
        name: display.to_string(),
    }
}

#[tokio::test]
async fn test_two_participants_share_and_disconnect() {
    let hub = TestHub::start().await;
    let mut a = hub.client().await;
    let mut b = hub.client().await;
    assert_ne!(a.id, b.id);

    a.send(&join("abc", "Al")).await;
    assert_eq!(
        a.recv().await,
        ServerEvent::CurrentPeers {
            room_id: room("abc"),
            peers: vec![],
            share: ShareState::default(),
        }
    );
    assert_eq!(a.recv().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });
    assert_eq!(b.recv().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });

    b.send(&join("abc", "Bo")).await;
    assert_eq!(
        b.recv().await,
        ServerEvent::CurrentPeers {
            room_id: room("abc"),
            peers: vec![PeerInfo { id: a.id, name: "Al".to_string() }],
            share: ShareState::default(),
        }
    );
    assert_eq!(
        a.recv().await,
        ServerEvent::PeerJoined {
            room_id: room("abc"),
            id: b.id,
            name: "Bo".to_string(),
        }
    );
    assert!(matches!(a.recv().await, ServerEvent::Rooms { .. }));
    assert!(matches!(b.recv().await, ServerEvent::Rooms { .. }));

    a.send(&ClientEvent::StartShare {
        room_id: room("abc"),
        name: "Al".to_string(),
    })
    .await;
    let started = ServerEvent::ShareStarted {
        room_id: room("abc"),
        id: a.id,
        name: "Al".to_string(),
    };
    assert_eq!(a.recv().await, started);
    assert_eq!(b.recv().await, started);

    let a_id = a.id;
    a.close().await;

    assert_eq!(b.recv().await, ServerEvent::PeerLeft { room_id: room("abc"), id: a_id });
    assert_eq!(b.recv().await, ServerEvent::ShareStopped { room_id: room("abc") });
    assert_eq!(b.recv().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });

    b.send(&ClientEvent::LeaveRoom { room_id: room("abc") }).await;
    assert_eq!(b.recv().await, ServerEvent::Rooms { room_ids: vec![] });
    assert!(hub.handle.rooms().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_share_from_non_owner_is_silent() {
    let hub = TestHub::start().await;
    let mut a = hub.client().await;
    let mut b = hub.client().await;

    a.send(&join("r", "Al")).await;
    a.recv().await; // current-peers
    a.recv().await; // rooms
    b.recv().await; // rooms

    b.send(&join("r", "Bo")).await;
    b.recv().await; // current-peers
    b.recv().await; // rooms
    a.recv().await; // peer-joined
    a.recv().await; // rooms

    a.send(&ClientEvent::StartShare {
        room_id: room("r"),
        name: String::new(),
    })
    .await;
    assert!(matches!(a.recv().await, ServerEvent::ShareStarted { .. }));
    assert!(matches!(b.recv().await, ServerEvent::ShareStarted { .. }));

    b.send(&ClientEvent::StopShare { room_id: room("r") }).await;
    // The next event b sees is the reply to its own request, not a share-stopped.
    b.send(&ClientEvent::GetRooms).await;
    assert_eq!(b.recv().await, ServerEvent::Rooms { room_ids: vec![room("r")] });

    let state = hub.handle.get_state().await.unwrap();
    assert_eq!(state.rooms[0].share.owner_id, Some(a.id));
    assert_eq!(state.rooms[0].share.owner_name.as_deref(), Some("Al"));
}

#[tokio::test]
async fn test_signal_relayed_with_sender_stamp() {
    let hub = TestHub::start().await;
    let mut a = hub.client().await;
    let mut b = hub.client().await;

    let payload = serde_json::json!({"type": "offer", "sdp": "v=0"});
    a.send(&ClientEvent::Signal {
        to: b.id,
        payload: payload.clone(),
    })
    .await;

    assert_eq!(b.recv().await, ServerEvent::Signal { from: a.id, payload });

    // Unknown targets are dropped without feedback.
    a.send(&ClientEvent::Signal {
        to: ParticipantId::new(),
        payload: serde_json::json!({"type": "answer", "sdp": "x"}),
    })
    .await;
    a.send(&ClientEvent::GetRooms).await;
    assert_eq!(a.recv().await, ServerEvent::Rooms { room_ids: vec![] });
}

#[tokio::test]
async fn test_malformed_frame_yields_error_event() {
    let hub = TestHub::start().await;
    let mut a = hub.client().await;

    a.send_raw("{not json").await;
    assert!(matches!(a.recv().await, ServerEvent::Error { code: 1, .. }));

    a.send_raw(r#"{"event":"no-such-event","data":{}}"#).await;
    assert!(matches!(a.recv().await, ServerEvent::Error { code: 1, .. }));

    // The connection stays usable.
    a.send(&ClientEvent::GetRooms).await;
    assert_eq!(a.recv().await, ServerEvent::Rooms { room_ids: vec![] });
}

#[tokio::test]
async fn test_chat_broadcast_to_room() {
    let hub = TestHub::start().await;
    let mut a = hub.client().await;
    let mut b = hub.client().await;

    a.send(&join("c", "Al")).await;
    a.recv().await;
    a.recv().await;
    b.recv().await;
    b.send(&join("c", "Bo")).await;
    b.recv().await;
    b.recv().await;
    a.recv().await;
    a.recv().await;

    b.send(&ClientEvent::ChatMessage {
        room_id: room("c"),
        text: "hello".to_string(),
        name: "Bo".to_string(),
        ts: 1_700_000_000_000,
    })
    .await;

    let expected = ServerEvent::ChatMessage {
        room_id: room("c"),
        from: b.id,
        text: "hello".to_string(),
        name: "Bo".to_string(),
        ts: 1_700_000_000_000,
    };
    assert_eq!(a.recv().await, expected);
    assert_eq!(b.recv().await, expected);
}
