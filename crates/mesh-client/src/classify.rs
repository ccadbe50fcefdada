//! Inbound stream classification.
//!
//! A remote video stream is either the sender's camera or its screen share.
//! The room's registered share owner decides when it is known; otherwise the
//! capture-surface label is used.

use crate::media::MediaKind;

use common::protocol::ShareState;
use common::types::ParticipantId;

/// Label fragments that identify a display capture.
const SCREEN_LABEL_HINTS: [&str; 4] = ["screen", "display", "window", "monitor"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Camera,
    Screen,
}

/// Classify by track label alone.
#[must_use]
pub fn classify_by_label(kind: MediaKind, label: &str) -> StreamKind {
    match kind {
        MediaKind::Audio => StreamKind::Audio,
        MediaKind::Video => {
            let label = label.to_ascii_lowercase();
            if SCREEN_LABEL_HINTS.iter().any(|hint| label.contains(hint)) {
                StreamKind::Screen
            } else {
                StreamKind::Camera
            }
        }
    }
}

/// Classify a stream received from `peer`.
///
/// `share` is `None` until the room's share state has been received.
#[must_use]
pub fn classify_remote(
    peer: ParticipantId,
    kind: MediaKind,
    label: &str,
    share: Option<&ShareState>,
) -> StreamKind {
    match (kind, share) {
        (MediaKind::Audio, _) => StreamKind::Audio,
        (MediaKind::Video, Some(share)) => {
            if share.is_owner(peer) {
                StreamKind::Screen
            } else {
                StreamKind::Camera
            }
        }
        (MediaKind::Video, None) => classify_by_label(kind, label),
    }
}
