//! Polling and event-waiting helpers.

use std::time::Duration;
use tokio::sync::mpsc;

/// Default time tests wait for an asynchronous effect.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Receive events until one matches, discarding the others.
///
/// Panics on timeout or when the channel closes.
pub async fn next_matching<T, F>(receiver: &mut mpsc::Receiver<T>, mut predicate: F) -> T
where
    T: std::fmt::Debug,
    F: FnMut(&T) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, receiver.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// Drain everything currently queued.
pub fn drain<T>(receiver: &mut mpsc::Receiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
