//! `ConnectionActor` - per-WebSocket writer actor.
//!
//! Each `ConnectionActor`:
//! - Owns the outbound half of exactly one client connection
//! - Serializes every event for that client, so events from the hub arrive
//!   in the order the hub produced them
//! - Never blocks the hub: the handle enqueues with `try_send` and a full
//!   mailbox drops the event for this client only
//!
//! # Lifecycle
//!
//! 1. Spawned by the `HubActor` when a WebSocket is accepted
//! 2. Runs until the client disconnects, a write fails, or the hub shuts down
//! 3. Cancellation via child token propagates from the `HubActor`

use crate::errors::HubError;

use super::messages::{ConnectionMessage, EventSink};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::protocol::ServerEvent;
use common::types::ParticipantId;
use futures::SinkExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    participant_id: ParticipantId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    /// Get the participant ID served by this connection.
    #[must_use]
    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Enqueue an event for the client without waiting.
    ///
    /// # Errors
    ///
    /// - `HubError::Backpressure` if the mailbox is full (event dropped)
    /// - `HubError::NotConnected` if the actor has exited
    pub fn send(&self, event: ServerEvent) -> Result<(), HubError> {
        self.mailbox.record_enqueue();
        match self.sender.try_send(ConnectionMessage::Send { event }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_dequeue();
                self.mailbox.record_drop();
                crate::observability::metrics::record_event_dropped("backpressure");
                Err(HubError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mailbox.record_dequeue();
                Err(HubError::NotConnected(self.participant_id.to_string()))
            }
        }
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    participant_id: ParticipantId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Cancellation token (child of the hub's token).
    cancel_token: CancellationToken,
    sink: EventSink,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    is_closing: bool,
}

impl ConnectionActor {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        participant_id: ParticipantId,
        sink: EventSink,
        buffer: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            participant_id.to_string(),
        ));

        let actor = Self {
            participant_id,
            receiver,
            cancel_token: cancel_token.clone(),
            sink,
            metrics,
            mailbox: Arc::clone(&mailbox),
            is_closing: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            participant_id,
            mailbox,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "hub.actor.connection",
        fields(participant_id = %self.participant_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "hub.actor.connection",
            participant_id = %self.participant_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "hub.actor.connection",
                        participant_id = %self.participant_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.graceful_close("cancelled").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let should_exit = self.handle_message(message).await;
                            self.metrics.record_message_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "hub.actor.connection",
                                participant_id = %self.participant_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            self.graceful_close("hub released connection").await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.connection",
            participant_id = %self.participant_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { event } => {
                self.mailbox.record_dequeue();
                self.handle_send(event).await
            }
        }
    }

    /// Write one event. Returns true if the connection is unusable.
    async fn handle_send(&mut self, event: ServerEvent) -> bool {
        if self.is_closing {
            warn!(
                target: "hub.actor.connection",
                participant_id = %self.participant_id,
                "Attempted to send event while closing"
            );
            return false;
        }

        debug!(
            target: "hub.actor.connection",
            participant_id = %self.participant_id,
            event = event.name(),
            "Sending event to client"
        );

        if let Err(e) = self.sink.send(event).await {
            warn!(
                target: "hub.actor.connection",
                participant_id = %self.participant_id,
                error = %e,
                "Write to client failed, stopping connection"
            );
            self.is_closing = true;
            return true;
        }

        false
    }

    /// Gracefully close the connection.
    async fn graceful_close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }

        self.is_closing = true;

        debug!(
            target: "hub.actor.connection",
            participant_id = %self.participant_id,
            reason = %reason,
            "Closing connection"
        );

        if let Err(e) = self.sink.close().await {
            debug!(
                target: "hub.actor.connection",
                participant_id = %self.participant_id,
                error = %e,
                "Close frame not delivered"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::RoomId;
    use futures::channel::mpsc as fmpsc;
    use futures::StreamExt;
    use std::time::Duration;

    fn channel_sink() -> (EventSink, fmpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = fmpsc::unbounded();
        let sink = tx.sink_map_err(|e| HubError::Transport(e.to_string()));
        (Box::pin(sink), rx)
    }

    fn rooms_event(name: &str) -> ServerEvent {
        ServerEvent::Rooms {
            room_ids: vec![RoomId::from(name)],
        }
    }

    #[tokio::test]
    async fn test_connection_actor_delivers_in_order() {
        let (sink, mut rx) = channel_sink();
        let id = ParticipantId::new();
        let (handle, _task) =
            ConnectionActor::spawn(id, sink, 16, CancellationToken::new(), ActorMetrics::new());

        assert_eq!(handle.participant_id(), id);

        handle.send(rooms_event("one")).unwrap();
        handle.send(rooms_event("two")).unwrap();

        assert_eq!(rx.next().await, Some(rooms_event("one")));
        assert_eq!(rx.next().await, Some(rooms_event("two")));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_sends_close_and_ends_stream() {
        let (sink, mut rx) = channel_sink();
        let (handle, task) = ConnectionActor::spawn(
            ParticipantId::new(),
            sink,
            16,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_connection_actor_parent_cancellation() {
        let parent_token = CancellationToken::new();
        let (sink, _rx) = channel_sink();

        let (handle, task) = ConnectionActor::spawn(
            ParticipantId::new(),
            sink,
            16,
            parent_token.child_token(),
            ActorMetrics::new(),
        );

        parent_token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_send_after_exit_reports_not_connected() {
        let (sink, _rx) = channel_sink();
        let (handle, task) = ConnectionActor::spawn(
            ParticipantId::new(),
            sink,
            16,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        let result = handle.send(rooms_event("late"));
        assert!(matches!(result, Err(HubError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_write_failure_stops_actor() {
        let (sink, rx) = channel_sink();
        drop(rx);

        let (handle, task) = ConnectionActor::spawn(
            ParticipantId::new(),
            sink,
            16,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        handle.send(rooms_event("nobody listening")).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.is_ok());
    }
}
