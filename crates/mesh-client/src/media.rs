//! Local media abstractions.
//!
//! Capture devices and the tracks they produce sit behind traits so the
//! engine and track controller can be driven by any media stack.

use crate::errors::DeviceError;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Kind of media carried by a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// A live media track, local or remote.
#[async_trait]
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Capture-surface label reported by the platform.
    fn label(&self) -> &str;

    /// False once the source has ended (stopped locally or by the OS).
    fn is_live(&self) -> bool;

    fn is_enabled(&self) -> bool;

    /// Mute or unmute without releasing the source.
    fn set_enabled(&self, enabled: bool);

    /// Release the source. The track ends.
    fn stop(&self);

    /// Resolves once the track has ended.
    async fn ended(&self);
}

pub type SharedTrack = Arc<dyn MediaTrack>;

/// Capture device access.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<SharedTrack, DeviceError>;

    async fn open_camera(&self) -> Result<SharedTrack, DeviceError>;

    /// Open a display capture. A dismissed picker is `DeviceError::Cancelled`.
    async fn open_display(&self) -> Result<SharedTrack, DeviceError>;
}

/// The complete outbound track set attached to every new link.
#[derive(Debug, Clone)]
pub struct OutboundTracks {
    pub audio: SharedTrack,
    /// Camera or screen, never both.
    pub video: SharedTrack,
}

impl OutboundTracks {
    #[must_use]
    pub fn get(&self, kind: MediaKind) -> &SharedTrack {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}
