//! WebSocket transport for the hub.
//!
//! Each accepted socket is split: the write half becomes the sink of a
//! `ConnectionActor` (owned by the hub), and the read half is drained here,
//! decoding one `ClientEvent` per text frame and forwarding it to the hub.
//! Frames from one socket are forwarded in arrival order.

use crate::actors::HubActorHandle;
use crate::errors::HubError;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use common::error::ProtocolError;
use common::protocol::{ClientEvent, ServerEvent};
use common::types::ParticipantId;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, instrument, warn};

/// Router serving `GET /ws`.
pub fn router(hub: HubActorHandle) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(hub)
}

async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<HubActorHandle>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Serve one WebSocket until the client goes away or the hub shuts down.
#[instrument(skip_all, name = "hub.ws")]
async fn handle_socket(socket: WebSocket, hub: HubActorHandle) {
    let (ws_tx, mut ws_rx) = socket.split();

    let sink = ws_tx
        .sink_map_err(|e| HubError::Transport(e.to_string()))
        .with(|event: ServerEvent| async move {
            event.to_json().map(Message::Text).map_err(HubError::from)
        });

    let participant_id = match hub.connect(Box::pin(sink)).await {
        Ok(id) => id,
        Err(e) => {
            warn!(target: "hub.ws", error = %e, "Connection rejected");
            return;
        }
    };

    info!(target: "hub.ws", participant_id = %participant_id, "WebSocket connected");

    let cancel_token = hub.child_token();
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "hub.ws", participant_id = %participant_id, "Hub shutting down, closing reader");
                break;
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch(&hub, participant_id, &text).await {
                            warn!(
                                target: "hub.ws",
                                participant_id = %participant_id,
                                error = %e,
                                "Hub unavailable, closing reader"
                            );
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let error = HubError::from(ProtocolError::Malformed(
                            "binary frames are not supported".to_string(),
                        ));
                        if hub.reject(participant_id, error).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(target: "hub.ws", participant_id = %participant_id, "Client closed socket");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(
                            target: "hub.ws",
                            participant_id = %participant_id,
                            error = %e,
                            "Socket read failed"
                        );
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = hub.disconnect(participant_id).await {
        debug!(
            target: "hub.ws",
            participant_id = %participant_id,
            error = %e,
            "Disconnect not delivered to hub"
        );
    }

    info!(target: "hub.ws", participant_id = %participant_id, "WebSocket disconnected");
}

/// Decode one text frame and hand it to the hub.
///
/// Returns an error only when the hub itself is unreachable; rejected or
/// dropped client requests are not errors for the reader.
async fn dispatch(hub: &HubActorHandle, participant_id: ParticipantId, text: &str) -> Result<(), HubError> {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(
                target: "hub.ws",
                participant_id = %participant_id,
                error = %e,
                "Undecodable frame"
            );
            return hub.reject(participant_id, HubError::from(e)).await;
        }
    };

    debug!(
        target: "hub.ws",
        participant_id = %participant_id,
        event = event.name(),
        "Client event"
    );

    let result = match event {
        ClientEvent::JoinRoom { room_id, name } => hub.join(participant_id, room_id, name).await.map(|_| ()),
        ClientEvent::LeaveRoom { room_id } => hub.leave(participant_id, room_id).await,
        ClientEvent::GetRooms => hub.request_rooms(participant_id).await,
        ClientEvent::StartShare { room_id, name } => hub.start_share(participant_id, room_id, name).await,
        ClientEvent::StopShare { room_id } => hub.stop_share(participant_id, room_id).await.map(|_| ()),
        ClientEvent::Signal { to, payload } => hub.relay(participant_id, to, payload).await,
        ClientEvent::ChatMessage {
            room_id,
            text,
            name,
            ts,
        } => hub.chat(participant_id, room_id, text, name, ts).await,
    };

    match result {
        Err(e @ (HubError::Internal(_) | HubError::Draining)) => Err(e),
        Err(e) => {
            debug!(
                target: "hub.ws",
                participant_id = %participant_id,
                error = %e,
                "Client request dropped"
            );
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}
