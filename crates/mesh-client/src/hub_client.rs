//! WebSocket client for the rendezvous hub.
//!
//! The socket is split into a writer task, fed by a bounded channel of
//! `ClientEvent`s, and a reader task that decodes `ServerEvent`s into the
//! channel returned by `connect`. Either task stopping stops the other.

use crate::errors::MeshError;
use crate::signaling::{SignalPayload, SignalingChannel};

use async_trait::async_trait;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::{ParticipantId, RoomId};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for the hub's `welcome` after the socket opens.
pub const DEFAULT_WELCOME_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOUND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 256;

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection to the hub.
///
/// Dropping the client closes the socket.
#[derive(Debug)]
pub struct HubClient {
    local_id: ParticipantId,
    outbound: mpsc::Sender<ClientEvent>,
    cancel_token: CancellationToken,
}

impl HubClient {
    /// Connect and wait for `welcome`.
    ///
    /// Returns the client and the stream of every event after `welcome`.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ServerEvent>), MeshError> {
        Self::connect_with_timeout(url, DEFAULT_WELCOME_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        welcome_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), MeshError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| MeshError::Signaling(format!("connect to {url} failed: {e}")))?;
        let (write, mut read) = socket.split();

        let local_id = tokio::time::timeout(welcome_timeout, await_welcome(&mut read))
            .await
            .map_err(|_| MeshError::Signaling("no welcome from hub".to_string()))??;

        info!(target: "mesh.hub_client", url = %url, local_id = %local_id, "Connected to hub");

        let cancel_token = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(run_writer(write, outbound_rx, cancel_token.clone()));
        tokio::spawn(run_reader(read, inbound_tx, cancel_token.clone()));

        let client = Self {
            local_id,
            outbound,
            cancel_token,
        };
        Ok((client, inbound))
    }

    /// Participant id assigned by the hub.
    #[must_use]
    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    pub async fn join_room(&self, room_id: RoomId, name: &str) -> Result<(), MeshError> {
        self.send(ClientEvent::JoinRoom {
            room_id,
            name: name.to_string(),
        })
        .await
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), MeshError> {
        self.send(ClientEvent::LeaveRoom { room_id }).await
    }

    /// Ask for the room list; the reply arrives as `rooms`.
    pub async fn get_rooms(&self) -> Result<(), MeshError> {
        self.send(ClientEvent::GetRooms).await
    }

    /// Send a chat line stamped with the current time.
    pub async fn send_chat(&self, room_id: RoomId, text: &str, name: &str) -> Result<(), MeshError> {
        self.send(ClientEvent::ChatMessage {
            room_id,
            text: text.to_string(),
            name: name.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
        })
        .await
    }

    /// Close the socket. Pending outbound events may be lost.
    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, event: ClientEvent) -> Result<(), MeshError> {
        if self.cancel_token.is_cancelled() {
            return Err(MeshError::Signaling("hub connection closed".to_string()));
        }
        self.outbound
            .send(event)
            .await
            .map_err(|e| MeshError::Signaling(format!("channel send failed: {e}")))
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[async_trait]
impl SignalingChannel for HubClient {
    async fn send_signal(&self, to: ParticipantId, payload: SignalPayload) -> Result<(), MeshError> {
        let payload = payload.to_value()?;
        self.send(ClientEvent::Signal { to, payload }).await
    }

    async fn start_share(&self, room_id: &RoomId, name: &str) -> Result<(), MeshError> {
        self.send(ClientEvent::StartShare {
            room_id: room_id.clone(),
            name: name.to_string(),
        })
        .await
    }

    async fn stop_share(&self, room_id: &RoomId) -> Result<(), MeshError> {
        self.send(ClientEvent::StopShare {
            room_id: room_id.clone(),
        })
        .await
    }
}

async fn await_welcome(read: &mut SplitStream<HubSocket>) -> Result<ParticipantId, MeshError> {
    while let Some(frame) = read.next().await {
        match frame.map_err(|e| MeshError::Signaling(e.to_string()))? {
            Message::Text(text) => {
                return match ServerEvent::from_json(&text)? {
                    ServerEvent::Welcome { id } => Ok(id),
                    other => Err(MeshError::Signaling(format!(
                        "expected welcome, got {}",
                        other.name()
                    ))),
                };
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(MeshError::Signaling("hub closed before welcome".to_string()))
}

async fn run_writer(
    mut write: SplitSink<HubSocket, Message>,
    mut outbound: mpsc::Receiver<ClientEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            event = outbound.recv() => {
                let Some(event) = event else {
                    break;
                };
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "mesh.hub_client", event = event.name(), error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!(target: "mesh.hub_client", error = %e, "Hub write failed");
                    cancel_token.cancel();
                    break;
                }
            }
        }
    }

    if let Err(e) = write.close().await {
        debug!(target: "mesh.hub_client", error = %e, "Socket close failed");
    }
    debug!(target: "mesh.hub_client", "Writer stopped");
}

async fn run_reader(
    mut read: SplitStream<HubSocket>,
    inbound: mpsc::Sender<ServerEvent>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            if inbound.send(event).await.is_err() {
                                debug!(target: "mesh.hub_client", "Event receiver dropped");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(target: "mesh.hub_client", error = %e, "Undecodable hub frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!(target: "mesh.hub_client", "Hub closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(target: "mesh.hub_client", error = %e, "Hub read failed");
                        break;
                    }
                }
            }
        }
    }

    cancel_token.cancel();
    debug!(target: "mesh.hub_client", "Reader stopped");
}
