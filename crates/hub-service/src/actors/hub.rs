//! `HubActor` - singleton owner of the session directory.
//!
//! The `HubActor` is the top-level actor in the hub:
//!
//! - Singleton per hub instance
//! - Owns the `SessionDirectory`; every room mutation goes through its mailbox
//! - Supervises one `ConnectionActor` per accepted WebSocket
//! - Turns directory outcomes into events for the affected connections
//! - Monitors connection actor health (panic detection via `JoinHandle`)
//!
//! # Delivery
//!
//! Events are enqueued on connection mailboxes with `try_send`. A slow client
//! loses events instead of stalling the hub.
//!
//! # Graceful Shutdown
//!
//! On cancellation, the hub:
//! 1. Stops accepting new connections
//! 2. Cancels every connection actor (child tokens)
//! 3. Waits for connection tasks to finish, bounded per task

use crate::directory::{LeaveOutcome, SessionDirectory};
use crate::errors::HubError;
use crate::observability::metrics as hub_metrics;

use super::connection::{ConnectionActor, ConnectionActorHandle};
use super::messages::{EventSink, HubMessage, HubState, JoinResult};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::ServerEvent;
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the hub mailbox.
const HUB_CHANNEL_BUFFER: usize = 1000;

/// Time allowed for each connection actor to finish during shutdown.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `HubActor`.
///
/// This is the public interface used by the WebSocket layer and tests.
#[derive(Clone, Debug)]
pub struct HubActorHandle {
    sender: mpsc::Sender<HubMessage>,
    cancel_token: CancellationToken,
    hub_id: String,
}

impl HubActorHandle {
    /// Get the hub instance ID.
    #[must_use]
    pub fn hub_id(&self) -> &str {
        &self.hub_id
    }

    /// Register a new connection and get its participant id.
    ///
    /// The hub sends `welcome` through `sink` before this returns.
    pub async fn connect(&self, sink: EventSink) -> Result<ParticipantId, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::Connect {
            sink,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a connection and cascade leaves for every room it joined.
    pub async fn disconnect(&self, participant_id: ParticipantId) -> Result<(), HubError> {
        self.send(HubMessage::Disconnect { participant_id }).await
    }

    /// Join a room.
    pub async fn join(
        &self,
        participant_id: ParticipantId,
        room_id: RoomId,
        name: String,
    ) -> Result<JoinResult, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::Join {
            participant_id,
            room_id,
            name,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave a single room.
    pub async fn leave(&self, participant_id: ParticipantId, room_id: RoomId) -> Result<(), HubError> {
        self.send(HubMessage::Leave {
            participant_id,
            room_id,
        })
        .await
    }

    /// Ask the hub to send the room list to one connection.
    pub async fn request_rooms(&self, participant_id: ParticipantId) -> Result<(), HubError> {
        self.send(HubMessage::RequestRooms { participant_id }).await
    }

    /// Get the ids of every non-empty room, sorted.
    pub async fn rooms(&self) -> Result<Vec<RoomId>, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::GetRooms { respond_to: tx }).await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Claim a room's screen share, replacing any current owner.
    pub async fn start_share(
        &self,
        participant_id: ParticipantId,
        room_id: RoomId,
        name: String,
    ) -> Result<(), HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::StartShare {
            participant_id,
            room_id,
            name,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))?
    }

    /// Release a room's screen share.
    ///
    /// Returns `true` only if the requester was the owner.
    pub async fn stop_share(&self, participant_id: ParticipantId, room_id: RoomId) -> Result<bool, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::StopShare {
            participant_id,
            room_id,
            respond_to: tx,
        })
        .await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Relay a signaling payload. Unknown targets are dropped.
    pub async fn relay(
        &self,
        from: ParticipantId,
        to: ParticipantId,
        payload: serde_json::Value,
    ) -> Result<(), HubError> {
        self.send(HubMessage::Relay { from, to, payload }).await
    }

    /// Broadcast a chat line to a room.
    pub async fn chat(
        &self,
        from: ParticipantId,
        room_id: RoomId,
        text: String,
        name: String,
        ts: i64,
    ) -> Result<(), HubError> {
        self.send(HubMessage::Chat {
            from,
            room_id,
            text,
            name,
            ts,
        })
        .await
    }

    /// Report a rejected frame back to the client that sent it.
    pub async fn reject(&self, participant_id: ParticipantId, error: HubError) -> Result<(), HubError> {
        self.send(HubMessage::ClientError {
            participant_id,
            error,
        })
        .await
    }

    /// Get the current hub state.
    pub async fn get_state(&self) -> Result<HubState, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(HubMessage::GetState { respond_to: tx }).await?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for tasks that must stop with the hub.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    async fn send(&self, message: HubMessage) -> Result<(), HubError> {
        if self.cancel_token.is_cancelled() {
            return Err(HubError::Draining);
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))
    }
}

/// Internal state for a managed connection.
struct ManagedConnection {
    handle: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `HubActor` implementation.
///
/// This struct owns the actor state and runs the message loop.
pub struct HubActor {
    hub_id: String,
    receiver: mpsc::Receiver<HubMessage>,
    /// Cancellation token (root of every connection token).
    cancel_token: CancellationToken,
    directory: SessionDirectory,
    connections: HashMap<ParticipantId, ManagedConnection>,
    /// Mailbox size for each new connection actor.
    connection_buffer: usize,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
    is_shutting_down: bool,
}

impl HubActor {
    /// Spawn the hub actor.
    ///
    /// Returns a handle and the task join handle. Cancelling `cancel_token`
    /// shuts the hub and all of its connections down.
    pub fn spawn(
        hub_id: String,
        cancel_token: CancellationToken,
        connection_buffer: usize,
        metrics: Arc<ActorMetrics>,
    ) -> (HubActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HUB_CHANNEL_BUFFER);
        let mailbox = MailboxMonitor::new(ActorType::Hub, hub_id.clone());

        let actor = Self {
            hub_id: hub_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            directory: SessionDirectory::new(),
            connections: HashMap::new(),
            connection_buffer,
            metrics,
            mailbox,
            is_shutting_down: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = HubActorHandle {
            sender,
            cancel_token,
            hub_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "hub.actor.hub", fields(hub_id = %self.hub_id))]
    async fn run(mut self) {
        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            "HubActor started"
        );

        loop {
            // Writers that stopped on their own (write failure or panic)
            self.check_connection_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.hub",
                        hub_id = %self.hub_id,
                        "HubActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "hub.actor.hub",
                                hub_id = %self.hub_id,
                                "HubActor channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            rooms_remaining = self.directory.room_count(),
            messages_processed = self.mailbox.messages_processed(),
            "HubActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: HubMessage) {
        match message {
            HubMessage::Connect { sink, respond_to } => {
                let result = self.handle_connect(sink);
                let _ = respond_to.send(result);
            }

            HubMessage::Disconnect { participant_id } => {
                self.handle_disconnect(participant_id);
            }

            HubMessage::Join {
                participant_id,
                room_id,
                name,
                respond_to,
            } => {
                let result = self.handle_join(participant_id, &room_id, &name);
                let _ = respond_to.send(result);
            }

            HubMessage::Leave {
                participant_id,
                room_id,
            } => {
                self.handle_leave(participant_id, &room_id);
            }

            HubMessage::RequestRooms { participant_id } => {
                let event = ServerEvent::Rooms {
                    room_ids: self.directory.room_ids(),
                };
                self.deliver(participant_id, event);
            }

            HubMessage::GetRooms { respond_to } => {
                let _ = respond_to.send(self.directory.room_ids());
            }

            HubMessage::StartShare {
                participant_id,
                room_id,
                name,
                respond_to,
            } => {
                let result = self.handle_start_share(participant_id, &room_id, &name);
                let _ = respond_to.send(result);
            }

            HubMessage::StopShare {
                participant_id,
                room_id,
                respond_to,
            } => {
                let cleared = self.handle_stop_share(participant_id, &room_id);
                let _ = respond_to.send(cleared);
            }

            HubMessage::Relay { from, to, payload } => {
                self.handle_relay(from, to, payload);
            }

            HubMessage::Chat {
                from,
                room_id,
                text,
                name,
                ts,
            } => {
                let members = self.directory.members(&room_id);
                let event = ServerEvent::ChatMessage {
                    room_id,
                    from,
                    text,
                    name,
                    ts,
                };
                self.broadcast(&members, &event);
            }

            HubMessage::ClientError {
                participant_id,
                error,
            } => {
                debug!(
                    target: "hub.actor.hub",
                    participant_id = %participant_id,
                    error = %error,
                    "Rejecting client frame"
                );
                let event = ServerEvent::Error {
                    code: error.error_code(),
                    message: error.client_message(),
                };
                self.deliver(participant_id, event);
            }

            HubMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    /// Spawn a writer for a new connection and greet it.
    fn handle_connect(&mut self, sink: EventSink) -> Result<ParticipantId, HubError> {
        if self.is_shutting_down {
            warn!(
                target: "hub.actor.hub",
                hub_id = %self.hub_id,
                "Rejecting connection - hub is shutting down"
            );
            return Err(HubError::Draining);
        }

        let participant_id = ParticipantId::new();
        let (handle, task_handle) = ConnectionActor::spawn(
            participant_id,
            sink,
            self.connection_buffer,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        if let Err(e) = handle.send(ServerEvent::Welcome { id: participant_id }) {
            handle.cancel();
            return Err(e);
        }

        self.connections.insert(
            participant_id,
            ManagedConnection {
                handle,
                task_handle,
            },
        );
        self.metrics.connection_created();
        hub_metrics::set_connections_active(self.connections.len());

        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            participant_id = %participant_id,
            connection_count = self.connections.len(),
            "Connection registered"
        );

        Ok(participant_id)
    }

    fn handle_disconnect(&mut self, participant_id: ParticipantId) {
        let Some(managed) = self.connections.remove(&participant_id) else {
            debug!(
                target: "hub.actor.hub",
                participant_id = %participant_id,
                "Disconnect for unknown connection ignored"
            );
            return;
        };

        managed.handle.cancel();
        tokio::spawn(reap_connection(
            participant_id,
            managed.task_handle,
            Arc::clone(&self.metrics),
        ));
        self.metrics.connection_closed();
        hub_metrics::set_connections_active(self.connections.len());

        let outcomes = self.directory.remove_participant(participant_id);

        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            participant_id = %participant_id,
            rooms_left = outcomes.len(),
            "Connection removed"
        );

        self.notify_departure(participant_id, &outcomes);
    }

    fn handle_join(
        &mut self,
        participant_id: ParticipantId,
        room_id: &RoomId,
        name: &str,
    ) -> Result<JoinResult, HubError> {
        if !self.connections.contains_key(&participant_id) {
            return Err(HubError::NotConnected(participant_id.to_string()));
        }

        let outcome = self.directory.join(participant_id, room_id, name);

        debug!(
            target: "hub.actor.hub",
            participant_id = %participant_id,
            room_id = %room_id,
            newly_joined = outcome.newly_joined,
            room_created = outcome.room_created,
            peers = outcome.peers.len(),
            "Participant joined room"
        );

        self.deliver(
            participant_id,
            ServerEvent::CurrentPeers {
                room_id: room_id.clone(),
                peers: outcome.peers.clone(),
                share: outcome.share.clone(),
            },
        );

        if outcome.newly_joined {
            let existing: Vec<ParticipantId> = outcome.peers.iter().map(|peer| peer.id).collect();
            self.broadcast(
                &existing,
                &ServerEvent::PeerJoined {
                    room_id: room_id.clone(),
                    id: participant_id,
                    name: outcome.name.clone(),
                },
            );
            self.broadcast_rooms();
        }

        Ok(JoinResult {
            room_id: outcome.room_id,
            peers: outcome.peers,
            share: outcome.share,
        })
    }

    fn handle_leave(&mut self, participant_id: ParticipantId, room_id: &RoomId) {
        match self.directory.leave(participant_id, room_id) {
            Some(outcome) => {
                debug!(
                    target: "hub.actor.hub",
                    participant_id = %participant_id,
                    room_id = %room_id,
                    room_removed = outcome.room_removed,
                    "Participant left room"
                );
                self.notify_departure(participant_id, &[outcome]);
            }
            None => {
                debug!(
                    target: "hub.actor.hub",
                    participant_id = %participant_id,
                    room_id = %room_id,
                    "Leave for a room the participant is not in ignored"
                );
            }
        }
    }

    /// Emit `peer-left`, then `share-stopped` if needed, per room; then the room list.
    fn notify_departure(&self, participant_id: ParticipantId, outcomes: &[LeaveOutcome]) {
        if outcomes.is_empty() {
            return;
        }

        for outcome in outcomes {
            self.broadcast(
                &outcome.remaining,
                &ServerEvent::PeerLeft {
                    room_id: outcome.room_id.clone(),
                    id: participant_id,
                },
            );

            if outcome.share_cleared {
                hub_metrics::record_share_change("owner_left");
                self.broadcast(
                    &outcome.remaining,
                    &ServerEvent::ShareStopped {
                        room_id: outcome.room_id.clone(),
                    },
                );
            }
        }

        self.broadcast_rooms();
    }

    fn handle_start_share(
        &mut self,
        participant_id: ParticipantId,
        room_id: &RoomId,
        name: &str,
    ) -> Result<(), HubError> {
        let outcome = match self.directory.start_share(participant_id, room_id, name) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    target: "hub.actor.hub",
                    participant_id = %participant_id,
                    room_id = %room_id,
                    error = %e,
                    "Share start from non-member dropped"
                );
                return Err(e);
            }
        };

        if let Some(previous) = outcome.previous.as_ref().filter(|p| p.id != participant_id) {
            info!(
                target: "hub.actor.hub",
                room_id = %room_id,
                previous_owner = %previous.id,
                new_owner = %participant_id,
                "Share ownership overwritten"
            );
            hub_metrics::record_share_change("overwritten");
        }
        hub_metrics::record_share_change("started");

        self.broadcast(
            &outcome.members,
            &ServerEvent::ShareStarted {
                room_id: room_id.clone(),
                id: outcome.owner.id,
                name: outcome.owner.name,
            },
        );

        Ok(())
    }

    fn handle_stop_share(&mut self, participant_id: ParticipantId, room_id: &RoomId) -> bool {
        let Some(members) = self.directory.stop_share(participant_id, room_id) else {
            debug!(
                target: "hub.actor.hub",
                participant_id = %participant_id,
                room_id = %room_id,
                "Share stop from non-owner ignored"
            );
            return false;
        };

        hub_metrics::record_share_change("stopped");
        self.broadcast(
            &members,
            &ServerEvent::ShareStopped {
                room_id: room_id.clone(),
            },
        );
        true
    }

    fn handle_relay(&mut self, from: ParticipantId, to: ParticipantId, payload: serde_json::Value) {
        let Some(managed) = self.connections.get(&to) else {
            debug!(
                target: "hub.actor.hub",
                from = %from,
                to = %to,
                "Signal for unknown target dropped"
            );
            hub_metrics::record_signal_dropped();
            return;
        };

        match managed.handle.send(ServerEvent::Signal { from, payload }) {
            Ok(()) => hub_metrics::record_signal_relayed(),
            Err(e) => {
                debug!(
                    target: "hub.actor.hub",
                    from = %from,
                    to = %to,
                    error = %e,
                    "Signal delivery failed"
                );
                hub_metrics::record_signal_dropped();
            }
        }
    }

    /// Send the room list to every connection.
    fn broadcast_rooms(&self) {
        hub_metrics::set_rooms_active(self.directory.room_count());
        let event = ServerEvent::Rooms {
            room_ids: self.directory.room_ids(),
        };
        for (participant_id, managed) in &self.connections {
            Self::try_deliver(*participant_id, &managed.handle, event.clone());
        }
    }

    fn broadcast(&self, targets: &[ParticipantId], event: &ServerEvent) {
        for participant_id in targets {
            self.deliver(*participant_id, event.clone());
        }
    }

    fn deliver(&self, participant_id: ParticipantId, event: ServerEvent) {
        match self.connections.get(&participant_id) {
            Some(managed) => Self::try_deliver(participant_id, &managed.handle, event),
            None => {
                debug!(
                    target: "hub.actor.hub",
                    participant_id = %participant_id,
                    event = event.name(),
                    "No connection for event target"
                );
            }
        }
    }

    fn try_deliver(participant_id: ParticipantId, handle: &ConnectionActorHandle, event: ServerEvent) {
        let name = event.name();
        if let Err(e) = handle.send(event) {
            debug!(
                target: "hub.actor.hub",
                participant_id = %participant_id,
                event = name,
                error = %e,
                "Event not delivered"
            );
        }
    }

    fn get_state(&self) -> HubState {
        HubState {
            hub_id: self.hub_id.clone(),
            connections: self.connections.len(),
            rooms: self.directory.snapshot(),
            is_shutting_down: self.is_shutting_down,
        }
    }

    /// Perform graceful shutdown.
    async fn graceful_shutdown(&mut self) {
        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            connection_count = self.connections.len(),
            "Performing graceful shutdown"
        );

        self.is_shutting_down = true;

        // Already cancelled via the parent token, but be explicit
        for managed in self.connections.values() {
            managed.handle.cancel();
        }

        for (participant_id, managed) in self.connections.drain() {
            match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "hub.actor.hub",
                        hub_id = %self.hub_id,
                        participant_id = %participant_id,
                        "Connection completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "hub.actor.hub",
                        hub_id = %self.hub_id,
                        participant_id = %participant_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "hub.actor.hub",
                        hub_id = %self.hub_id,
                        participant_id = %participant_id,
                        "Connection shutdown timed out"
                    );
                }
            }
            self.metrics.connection_closed();
        }
        hub_metrics::set_connections_active(0);

        info!(
            target: "hub.actor.hub",
            hub_id = %self.hub_id,
            "Graceful shutdown complete"
        );
    }

    /// Remove connections whose writer task has finished.
    ///
    /// A writer stops on its own only when the socket is unusable, so the
    /// participant is treated as disconnected.
    async fn check_connection_health(&mut self) {
        let finished: Vec<ParticipantId> = self
            .connections
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(participant_id, _)| *participant_id)
            .collect();

        for participant_id in finished {
            let Some(managed) = self.connections.remove(&participant_id) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "hub.actor.hub",
                        hub_id = %self.hub_id,
                        participant_id = %participant_id,
                        "Connection writer exited"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "hub.actor.hub",
                            hub_id = %self.hub_id,
                            participant_id = %participant_id,
                            error = ?join_error,
                            "Connection actor panicked - triggering investigation"
                        );
                        self.metrics.record_panic(ActorType::Connection);
                    }
                }
            }

            self.metrics.connection_closed();
            hub_metrics::set_connections_active(self.connections.len());

            let outcomes = self.directory.remove_participant(participant_id);
            self.notify_departure(participant_id, &outcomes);
        }
    }
}

/// Wait for a cancelled connection task and record a panic if it had one.
async fn reap_connection(participant_id: ParticipantId, task_handle: JoinHandle<()>, metrics: Arc<ActorMetrics>) {
    match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, task_handle).await {
        Ok(Ok(())) => {
            debug!(
                target: "hub.actor.hub",
                participant_id = %participant_id,
                "Connection completed cleanly"
            );
        }
        Ok(Err(e)) => {
            if e.is_panic() {
                metrics.record_panic(ActorType::Connection);
            }
        }
        Err(_) => {
            warn!(
                target: "hub.actor.hub",
                participant_id = %participant_id,
                "Connection close timed out"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use common::protocol::{PeerInfo, ShareState};
    use futures::channel::mpsc as fmpsc;
    use futures::{FutureExt, SinkExt, StreamExt};

    struct TestClient {
        id: ParticipantId,
        events: fmpsc::UnboundedReceiver<ServerEvent>,
    }

    impl TestClient {
        async fn connect(hub: &HubActorHandle) -> Self {
            let (tx, mut events) = fmpsc::unbounded();
            let sink = tx.sink_map_err(|e| HubError::Transport(e.to_string()));
            let id = hub.connect(Box::pin(sink)).await.unwrap();
            assert_eq!(events.next().await, Some(ServerEvent::Welcome { id }));
            Self { id, events }
        }

        async fn next(&mut self) -> ServerEvent {
            tokio::time::timeout(Duration::from_secs(1), self.events.next())
                .await
                .expect("timed out waiting for event")
                .expect("event stream ended")
        }

        /// Assert nothing is pending after the hub has processed everything
        /// queued so far.
        async fn assert_idle(&mut self, hub: &HubActorHandle) {
            hub.get_state().await.unwrap();
            tokio::task::yield_now().await;
            assert!(self.events.next().now_or_never().is_none());
        }
    }

    fn spawn_hub() -> (HubActorHandle, JoinHandle<()>) {
        HubActor::spawn(
            "hub-test".to_string(),
            CancellationToken::new(),
            64,
            ActorMetrics::new(),
        )
    }

    fn room(name: &str) -> RoomId {
        RoomId::from(name)
    }

    #[tokio::test]
    async fn test_join_sends_current_peers_then_peer_joined() {
        let (hub, _task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;
        let mut b = TestClient::connect(&hub).await;

        hub.join(a.id, room("abc"), "Al".to_string()).await.unwrap();
        assert_eq!(
            a.next().await,
            ServerEvent::CurrentPeers {
                room_id: room("abc"),
                peers: vec![],
                share: ShareState::default(),
            }
        );
        assert_eq!(a.next().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });
        assert_eq!(b.next().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });

        let result = hub.join(b.id, room("abc"), "Bo".to_string()).await.unwrap();
        assert_eq!(result.peers, vec![PeerInfo { id: a.id, name: "Al".to_string() }]);

        assert_eq!(
            b.next().await,
            ServerEvent::CurrentPeers {
                room_id: room("abc"),
                peers: vec![PeerInfo { id: a.id, name: "Al".to_string() }],
                share: ShareState::default(),
            }
        );
        assert_eq!(
            a.next().await,
            ServerEvent::PeerJoined {
                room_id: room("abc"),
                id: b.id,
                name: "Bo".to_string(),
            }
        );

        hub.cancel();
    }

    #[tokio::test]
    async fn test_repeated_join_does_not_announce_twice() {
        let (hub, _task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;
        let mut b = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();
        hub.join(b.id, room("r"), "Bo".to_string()).await.unwrap();
        hub.join(b.id, room("r"), "Bob".to_string()).await.unwrap();

        // a: current-peers, rooms, peer-joined, rooms
        for _ in 0..4 {
            a.next().await;
        }
        a.assert_idle(&hub).await;

        // b: rooms (from a's join), current-peers, rooms, current-peers
        assert!(matches!(b.next().await, ServerEvent::Rooms { .. }));
        assert!(matches!(b.next().await, ServerEvent::CurrentPeers { .. }));
        assert!(matches!(b.next().await, ServerEvent::Rooms { .. }));
        assert!(matches!(b.next().await, ServerEvent::CurrentPeers { .. }));
        b.assert_idle(&hub).await;

        hub.cancel();
    }

    #[tokio::test]
    async fn test_join_requires_connection() {
        let (hub, _task) = spawn_hub();

        let result = hub.join(ParticipantId::new(), room("r"), "X".to_string()).await;
        assert!(matches!(result, Err(HubError::NotConnected(_))));

        hub.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_sends_peer_left_then_share_stopped() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let mut b = TestClient::connect(&hub).await;

        hub.join(a.id, room("abc"), "Al".to_string()).await.unwrap();
        hub.join(b.id, room("abc"), "Bo".to_string()).await.unwrap();
        hub.start_share(a.id, room("abc"), "Al".to_string()).await.unwrap();

        // rooms, current-peers, rooms, share-started
        for _ in 0..3 {
            b.next().await;
        }
        assert_eq!(
            b.next().await,
            ServerEvent::ShareStarted {
                room_id: room("abc"),
                id: a.id,
                name: "Al".to_string(),
            }
        );

        hub.disconnect(a.id).await.unwrap();

        assert_eq!(b.next().await, ServerEvent::PeerLeft { room_id: room("abc"), id: a.id });
        assert_eq!(b.next().await, ServerEvent::ShareStopped { room_id: room("abc") });
        assert_eq!(b.next().await, ServerEvent::Rooms { room_ids: vec![room("abc")] });

        let state = hub.get_state().await.unwrap();
        assert_eq!(state.connections, 1);
        assert_eq!(state.rooms.len(), 1);
        assert!(state.rooms[0].share.owner_id.is_none());

        hub.cancel();
    }

    #[tokio::test]
    async fn test_last_member_leaving_removes_room() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;

        hub.join(a.id, room("solo"), "Al".to_string()).await.unwrap();
        assert_eq!(hub.rooms().await.unwrap(), vec![room("solo")]);

        hub.leave(a.id, room("solo")).await.unwrap();
        assert!(hub.rooms().await.unwrap().is_empty());

        hub.cancel();
    }

    #[tokio::test]
    async fn test_stop_share_by_non_owner_is_noop() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let b = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();
        hub.join(b.id, room("r"), "Bo".to_string()).await.unwrap();
        hub.start_share(a.id, room("r"), "Al".to_string()).await.unwrap();

        assert!(!hub.stop_share(b.id, room("r")).await.unwrap());
        let state = hub.get_state().await.unwrap();
        assert_eq!(state.rooms[0].share.owner_id, Some(a.id));

        assert!(hub.stop_share(a.id, room("r")).await.unwrap());
        let state = hub.get_state().await.unwrap();
        assert!(state.rooms[0].share.owner_id.is_none());

        hub.cancel();
    }

    #[tokio::test]
    async fn test_start_share_overwrites_owner() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let b = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();
        hub.join(b.id, room("r"), "Bo".to_string()).await.unwrap();
        hub.start_share(a.id, room("r"), "Al".to_string()).await.unwrap();
        hub.start_share(b.id, room("r"), "Bo".to_string()).await.unwrap();

        let state = hub.get_state().await.unwrap();
        assert_eq!(state.rooms[0].share.owner_id, Some(b.id));
        assert_eq!(state.rooms[0].share.owner_name.as_deref(), Some("Bo"));

        hub.cancel();
    }

    #[tokio::test]
    async fn test_start_share_from_non_member_is_dropped() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let b = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();

        let result = hub.start_share(b.id, room("r"), "Bo".to_string()).await;
        assert!(matches!(result, Err(HubError::NotMember(_))));

        let state = hub.get_state().await.unwrap();
        assert!(state.rooms[0].share.owner_id.is_none());

        hub.cancel();
    }

    #[tokio::test]
    async fn test_relay_stamps_sender() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let mut b = TestClient::connect(&hub).await;

        let payload = serde_json::json!({"type": "offer", "sdp": "v=0"});
        hub.relay(a.id, b.id, payload.clone()).await.unwrap();

        assert_eq!(b.next().await, ServerEvent::Signal { from: a.id, payload });

        hub.cancel();
    }

    #[tokio::test]
    async fn test_relay_to_unknown_target_is_dropped() {
        let (hub, _task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;

        hub.relay(a.id, ParticipantId::new(), serde_json::json!({}))
            .await
            .unwrap();
        a.assert_idle(&hub).await;

        hub.cancel();
    }

    #[tokio::test]
    async fn test_chat_reaches_room_including_sender() {
        let (hub, _task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();
        a.next().await;
        a.next().await;

        hub.chat(a.id, room("r"), "hi".to_string(), "Al".to_string(), 42)
            .await
            .unwrap();

        assert_eq!(
            a.next().await,
            ServerEvent::ChatMessage {
                room_id: room("r"),
                from: a.id,
                text: "hi".to_string(),
                name: "Al".to_string(),
                ts: 42,
            }
        );

        hub.cancel();
    }

    #[tokio::test]
    async fn test_reject_sends_error_event() {
        let (hub, _task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;

        hub.reject(a.id, HubError::Protocol("bad json".to_string()))
            .await
            .unwrap();

        assert_eq!(
            a.next().await,
            ServerEvent::Error {
                code: 1,
                message: "Malformed message".to_string(),
            }
        );

        hub.cancel();
    }

    #[tokio::test]
    async fn test_hub_shutdown_closes_connections() {
        let (hub, task) = spawn_hub();
        let mut a = TestClient::connect(&hub).await;

        hub.cancel();
        assert!(hub.is_cancelled());

        let result = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(result.is_ok());
        assert_eq!(a.events.next().await, None);

        let after = hub.rooms().await;
        assert!(matches!(after, Err(HubError::Draining)));
    }

    #[tokio::test]
    async fn test_closed_writer_is_treated_as_disconnect() {
        let (hub, _task) = spawn_hub();
        let a = TestClient::connect(&hub).await;
        let mut b = TestClient::connect(&hub).await;

        hub.join(a.id, room("r"), "Al".to_string()).await.unwrap();
        hub.join(b.id, room("r"), "Bo".to_string()).await.unwrap();
        for _ in 0..3 {
            b.next().await;
        }

        // Dropping the receiver makes the next write fail.
        drop(a);
        hub.chat(b.id, room("r"), "ping".to_string(), "Bo".to_string(), 1)
            .await
            .unwrap();
        assert!(matches!(b.next().await, ServerEvent::ChatMessage { .. }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Any message drives a health check.
        let _ = hub.get_state().await.unwrap();

        assert!(matches!(b.next().await, ServerEvent::PeerLeft { .. }));
        let state = hub.get_state().await.unwrap();
        assert_eq!(state.connections, 1);

        hub.cancel();
    }
}
