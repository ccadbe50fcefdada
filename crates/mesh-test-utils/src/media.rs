//! Fake capture tracks and devices.

use async_trait::async_trait;
use mesh_client::errors::DeviceError;
use mesh_client::media::{MediaDevices, MediaKind, MediaTrack, SharedTrack};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// In-memory track. `end()` simulates the source going away outside the app.
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    label: String,
    live: AtomicBool,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Arc<Self> {
        let (ended, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            kind,
            label: label.into(),
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            ended,
        })
    }

    pub fn microphone(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Audio, "Built-in Microphone")
    }

    pub fn camera(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Video, "FaceTime HD Camera")
    }

    pub fn screen(id: impl Into<String>) -> Arc<Self> {
        Self::new(id, MediaKind::Video, "screen:0:0")
    }

    /// The source ended (device unplugged, OS "stop sharing" bar, ...).
    pub fn end(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.ended.send_replace(true);
    }

    /// Shared handle for APIs taking `SharedTrack`.
    pub fn shared(self: &Arc<Self>) -> SharedTrack {
        Arc::clone(self) as SharedTrack
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.end();
    }

    async fn ended(&self) {
        let mut ended = self.ended.subscribe();
        let _ = ended.wait_for(|ended| *ended).await;
    }
}

#[derive(Default)]
struct DevicesInner {
    opened: usize,
    microphone_error: Option<DeviceError>,
    camera_error: Option<DeviceError>,
    display_error: Option<DeviceError>,
    microphones: Vec<Arc<FakeTrack>>,
    cameras: Vec<Arc<FakeTrack>>,
    displays: Vec<Arc<FakeTrack>>,
}

/// Fake capture devices.
///
/// Every open succeeds with a fresh `FakeTrack` unless a failure has been
/// configured for that device. Failures persist until `clear_failures`.
#[derive(Default)]
pub struct FakeDevices {
    inner: Mutex<DevicesInner>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_microphone(&self, error: DeviceError) {
        self.inner.lock().unwrap().microphone_error = Some(error);
    }

    pub fn fail_camera(&self, error: DeviceError) {
        self.inner.lock().unwrap().camera_error = Some(error);
    }

    pub fn fail_display(&self, error: DeviceError) {
        self.inner.lock().unwrap().display_error = Some(error);
    }

    /// The user dismisses the display picker.
    pub fn cancel_display(&self) {
        self.fail_display(DeviceError::Cancelled);
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.microphone_error = None;
        inner.camera_error = None;
        inner.display_error = None;
    }

    pub fn microphones(&self) -> Vec<Arc<FakeTrack>> {
        self.inner.lock().unwrap().microphones.clone()
    }

    pub fn cameras(&self) -> Vec<Arc<FakeTrack>> {
        self.inner.lock().unwrap().cameras.clone()
    }

    pub fn displays(&self) -> Vec<Arc<FakeTrack>> {
        self.inner.lock().unwrap().displays.clone()
    }

    pub fn last_camera(&self) -> Option<Arc<FakeTrack>> {
        self.inner.lock().unwrap().cameras.last().cloned()
    }

    pub fn last_display(&self) -> Option<Arc<FakeTrack>> {
        self.inner.lock().unwrap().displays.last().cloned()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self) -> Result<SharedTrack, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.microphone_error.clone() {
            return Err(error);
        }
        inner.opened += 1;
        let track = FakeTrack::microphone(format!("mic-{}", inner.opened));
        inner.microphones.push(Arc::clone(&track));
        Ok(track.shared())
    }

    async fn open_camera(&self) -> Result<SharedTrack, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.camera_error.clone() {
            return Err(error);
        }
        inner.opened += 1;
        let track = FakeTrack::camera(format!("camera-{}", inner.opened));
        inner.cameras.push(Arc::clone(&track));
        Ok(track.shared())
    }

    async fn open_display(&self) -> Result<SharedTrack, DeviceError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.display_error.clone() {
            return Err(error);
        }
        inner.opened += 1;
        let track = FakeTrack::screen(format!("screen-{}", inner.opened));
        inner.displays.push(Arc::clone(&track));
        Ok(track.shared())
    }
}

/// Microphone and camera tracks ready to publish as `OutboundTracks`.
pub fn outbound_tracks() -> mesh_client::media::OutboundTracks {
    mesh_client::media::OutboundTracks {
        audio: FakeTrack::microphone("mic-0"),
        video: FakeTrack::camera("camera-0"),
    }
}
