//! `TrackController` - local capture sources and outbound substitution.
//!
//! One controller per local participant. It owns the microphone, camera and
//! screen tracks and publishes the current outbound set on a `watch` channel
//! that the negotiation engine reads when it builds a link.
//!
//! Exactly one outbound video source exists at any time (`OutboundVideo`).
//! Switching between camera and screen never renegotiates: the new track is
//! substituted on every live link's existing video sender.

use crate::errors::{DeviceError, MeshError};
use crate::media::{MediaDevices, MediaKind, OutboundTracks, SharedTrack};
use crate::signaling::SignalingChannel;

use async_trait::async_trait;
use common::protocol::ShareState;
use common::types::{ParticipantId, RoomId};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const TRACK_CHANNEL_BUFFER: usize = 64;

/// Substitutes an outbound track on every live link.
#[async_trait]
pub trait TrackSubstitution: Send + Sync {
    /// Returns the number of links updated.
    async fn replace_outbound(&self, kind: MediaKind, track: SharedTrack) -> Result<usize, MeshError>;
}

/// Result of `start_screen_share`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    Started,
    /// The user dismissed the display picker.
    Cancelled,
    AlreadySharing,
}

/// The single outbound video source.
#[derive(Debug, Clone)]
pub enum OutboundVideo {
    Camera(SharedTrack),
    /// The camera stays open but disabled while the screen is sent.
    Screen {
        screen: SharedTrack,
        parked_camera: SharedTrack,
    },
}

impl OutboundVideo {
    /// The track peers currently receive.
    #[must_use]
    pub fn active(&self) -> &SharedTrack {
        match self {
            OutboundVideo::Camera(camera) => camera,
            OutboundVideo::Screen { screen, .. } => screen,
        }
    }

    #[must_use]
    pub fn is_screen(&self) -> bool {
        matches!(self, OutboundVideo::Screen { .. })
    }
}

/// Point-in-time view of local media.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalMediaState {
    pub initialized: bool,
    pub microphone_enabled: bool,
    /// Requested camera state. While sharing it applies once the camera is
    /// restored.
    pub camera_enabled: bool,
    pub sharing: bool,
    pub audio_track_id: Option<String>,
    /// Id of the outbound video track (camera or screen).
    pub video_track_id: Option<String>,
}

/// Collaborators of the controller.
pub struct TrackContext {
    pub local_id: ParticipantId,
    pub room_id: RoomId,
    /// Name sent with `start-share`.
    pub display_name: String,
    pub devices: Arc<dyn MediaDevices>,
    pub fanout: Arc<dyn TrackSubstitution>,
    pub signaling: Arc<dyn SignalingChannel>,
    /// Published outbound set, read by the engine.
    pub tracks: watch::Sender<Option<OutboundTracks>>,
    /// Room share state as last reported by the hub.
    pub share: watch::Receiver<ShareState>,
}

enum TrackMessage {
    InitLocalMedia {
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    SetMicrophone {
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    SetCamera {
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    StartScreenShare {
        respond_to: oneshot::Sender<Result<ShareOutcome, MeshError>>,
    },
    StopScreenShare {
        respond_to: oneshot::Sender<Result<bool, MeshError>>,
    },
    /// The display capture of share `generation` ended.
    ScreenEnded {
        generation: u64,
    },
    GetState {
        respond_to: oneshot::Sender<LocalMediaState>,
    },
}

/// Handle to the `TrackController`.
#[derive(Clone, Debug)]
pub struct TrackControllerHandle {
    sender: mpsc::Sender<TrackMessage>,
    cancel_token: CancellationToken,
}

impl TrackControllerHandle {
    /// Acquire one microphone and one camera track.
    ///
    /// Links are only built once this has succeeded.
    pub async fn init_local_media(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::InitLocalMedia { respond_to: tx }).await?;
        Self::reply(rx).await?
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::SetMicrophone {
            enabled,
            respond_to: tx,
        })
        .await?;
        Self::reply(rx).await?
    }

    /// Enable or disable the camera.
    ///
    /// Enabling a camera whose source has ended re-acquires it and
    /// substitutes the new track on every link.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::SetCamera {
            enabled,
            respond_to: tx,
        })
        .await?;
        Self::reply(rx).await?
    }

    pub async fn start_screen_share(&self) -> Result<ShareOutcome, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::StartScreenShare { respond_to: tx }).await?;
        Self::reply(rx).await?
    }

    /// Stop sharing and restore the camera. Returns `false` if not sharing.
    pub async fn stop_screen_share(&self) -> Result<bool, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::StopScreenShare { respond_to: tx }).await?;
        Self::reply(rx).await?
    }

    pub async fn state(&self) -> Result<LocalMediaState, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.send(TrackMessage::GetState { respond_to: tx }).await?;
        Self::reply(rx).await
    }

    /// Stop the controller. Local tracks are released.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    async fn reply<T>(rx: oneshot::Receiver<T>) -> Result<T, MeshError> {
        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    async fn send(&self, message: TrackMessage) -> Result<(), MeshError> {
        if self.cancel_token.is_cancelled() {
            return Err(MeshError::InvalidState("track controller stopped".to_string()));
        }
        self.sender
            .send(message)
            .await
            .map_err(|e| MeshError::Internal(format!("channel send failed: {e}")))
    }
}

struct LocalMedia {
    audio: SharedTrack,
    video: OutboundVideo,
}

/// The `TrackController` implementation.
pub struct TrackController {
    context: TrackContext,
    receiver: mpsc::Receiver<TrackMessage>,
    mailbox: mpsc::WeakSender<TrackMessage>,
    cancel_token: CancellationToken,
    media: Option<LocalMedia>,
    camera_enabled: bool,
    /// Set while we hold (or have asked for) the room's share.
    share_requested: bool,
    share_generation: u64,
}

impl TrackController {
    pub fn spawn(context: TrackContext, cancel_token: CancellationToken) -> (TrackControllerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(TRACK_CHANNEL_BUFFER);

        let controller = Self {
            context,
            receiver,
            mailbox: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            media: None,
            camera_enabled: false,
            share_requested: false,
            share_generation: 0,
        };

        let task_handle = tokio::spawn(controller.run());

        (TrackControllerHandle { sender, cancel_token }, task_handle)
    }

    #[instrument(skip_all, name = "mesh.tracks", fields(local_id = %self.context.local_id))]
    async fn run(mut self) {
        debug!(target: "mesh.tracks", "TrackController started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "mesh.tracks", "TrackController cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    }
                }
            }
        }

        self.release_devices();
        debug!(target: "mesh.tracks", "TrackController stopped");
    }

    async fn handle_message(&mut self, message: TrackMessage) {
        match message {
            TrackMessage::InitLocalMedia { respond_to } => {
                let result = self.handle_init().await;
                let _ = respond_to.send(result);
            }
            TrackMessage::SetMicrophone { enabled, respond_to } => {
                let result = self.handle_set_microphone(enabled);
                let _ = respond_to.send(result);
            }
            TrackMessage::SetCamera { enabled, respond_to } => {
                let result = self.handle_set_camera(enabled).await;
                let _ = respond_to.send(result);
            }
            TrackMessage::StartScreenShare { respond_to } => {
                let result = self.handle_start_share().await;
                let _ = respond_to.send(result);
            }
            TrackMessage::StopScreenShare { respond_to } => {
                let result = self.handle_stop_share().await;
                let _ = respond_to.send(result);
            }
            TrackMessage::ScreenEnded { generation } => self.handle_screen_ended(generation).await,
            TrackMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
        }
    }

    async fn handle_init(&mut self) -> Result<(), MeshError> {
        if self.media.is_some() {
            debug!(target: "mesh.tracks", "Local media already initialized");
            return Ok(());
        }

        let audio = self.context.devices.open_microphone().await.map_err(|e| {
            warn!(target: "mesh.tracks", error = %e, "Microphone acquisition failed");
            e
        })?;

        let camera = match self.context.devices.open_camera().await {
            Ok(camera) => camera,
            Err(e) => {
                warn!(target: "mesh.tracks", error = %e, "Camera acquisition failed");
                audio.stop();
                return Err(e.into());
            }
        };

        info!(
            target: "mesh.tracks",
            audio_track = audio.id(),
            video_track = camera.id(),
            "Local media initialized"
        );

        self.media = Some(LocalMedia {
            audio,
            video: OutboundVideo::Camera(camera),
        });
        self.camera_enabled = true;
        self.publish();
        Ok(())
    }

    fn handle_set_microphone(&self, enabled: bool) -> Result<(), MeshError> {
        let media = self.media.as_ref().ok_or_else(not_initialized)?;
        media.audio.set_enabled(enabled);
        debug!(target: "mesh.tracks", enabled, "Microphone toggled");
        Ok(())
    }

    async fn handle_set_camera(&mut self, enabled: bool) -> Result<(), MeshError> {
        let camera = match self.media.as_ref().map(|media| &media.video) {
            None => return Err(not_initialized()),
            Some(OutboundVideo::Screen { .. }) => {
                self.camera_enabled = enabled;
                debug!(target: "mesh.tracks", enabled, "Camera flag recorded while sharing");
                return Ok(());
            }
            Some(OutboundVideo::Camera(camera)) => Arc::clone(camera),
        };

        if !enabled {
            camera.set_enabled(false);
            self.camera_enabled = false;
            debug!(target: "mesh.tracks", "Camera disabled");
            return Ok(());
        }

        if camera.is_live() {
            camera.set_enabled(true);
            self.camera_enabled = true;
            debug!(target: "mesh.tracks", "Camera enabled");
            return Ok(());
        }

        info!(target: "mesh.tracks", track_id = camera.id(), "Camera source ended, re-acquiring");
        let fresh = self.context.devices.open_camera().await?;
        fresh.set_enabled(true);
        self.camera_enabled = true;
        self.set_video(OutboundVideo::Camera(Arc::clone(&fresh)));
        self.substitute_video(fresh).await;
        Ok(())
    }

    async fn handle_start_share(&mut self) -> Result<ShareOutcome, MeshError> {
        let camera = match self.media.as_ref().map(|media| &media.video) {
            None => return Err(not_initialized()),
            Some(OutboundVideo::Screen { .. }) => return Ok(ShareOutcome::AlreadySharing),
            Some(OutboundVideo::Camera(camera)) => Arc::clone(camera),
        };

        let screen = match self.context.devices.open_display().await {
            Ok(screen) => screen,
            Err(DeviceError::Cancelled) => {
                info!(target: "mesh.tracks", "Display picker cancelled");
                return Ok(ShareOutcome::Cancelled);
            }
            Err(e) => {
                warn!(target: "mesh.tracks", error = %e, "Display capture failed");
                return Err(e.into());
            }
        };

        camera.set_enabled(false);
        self.set_video(OutboundVideo::Screen {
            screen: Arc::clone(&screen),
            parked_camera: camera,
        });
        self.substitute_video(Arc::clone(&screen)).await;

        self.share_generation += 1;
        self.watch_screen(Arc::clone(&screen), self.share_generation);

        self.share_requested = true;
        if let Err(e) = self
            .context
            .signaling
            .start_share(&self.context.room_id, &self.context.display_name)
            .await
        {
            warn!(target: "mesh.tracks", error = %e, "Failed to announce share");
        }

        info!(target: "mesh.tracks", track_id = screen.id(), "Screen share started");
        Ok(ShareOutcome::Started)
    }

    async fn handle_stop_share(&mut self) -> Result<bool, MeshError> {
        let (screen, parked) = match self.media.as_ref().map(|media| &media.video) {
            Some(OutboundVideo::Screen { screen, parked_camera }) => (Arc::clone(screen), Arc::clone(parked_camera)),
            _ => return Ok(false),
        };

        let (camera, reacquire_error) = if parked.is_live() {
            (parked, None)
        } else {
            info!(target: "mesh.tracks", "Parked camera ended, re-acquiring");
            match self.context.devices.open_camera().await {
                Ok(fresh) => (fresh, None),
                Err(e) => {
                    warn!(target: "mesh.tracks", error = %e, "Camera re-acquisition failed");
                    (parked, Some(e))
                }
            }
        };

        camera.set_enabled(self.camera_enabled && reacquire_error.is_none());
        self.set_video(OutboundVideo::Camera(Arc::clone(&camera)));
        self.substitute_video(camera).await;
        screen.stop();

        self.release_share().await;
        info!(target: "mesh.tracks", "Screen share stopped");

        match reacquire_error {
            Some(e) => Err(e.into()),
            None => Ok(true),
        }
    }

    async fn handle_screen_ended(&mut self, generation: u64) {
        let sharing = self.media.as_ref().is_some_and(|media| media.video.is_screen());
        if generation != self.share_generation || !sharing {
            return;
        }

        info!(target: "mesh.tracks", "Display capture ended outside the app, stopping share");
        if let Err(e) = self.handle_stop_share().await {
            warn!(target: "mesh.tracks", error = %e, "Automatic share stop incomplete");
        }
    }

    /// Tell the hub we no longer share, unless someone else took over.
    async fn release_share(&mut self) {
        if !self.share_requested {
            return;
        }
        self.share_requested = false;

        let owner = self.context.share.borrow().owner_id;
        match owner {
            Some(owner) if owner != self.context.local_id => {
                debug!(target: "mesh.tracks", owner_id = %owner, "Share already taken over, not releasing");
            }
            _ => {
                if let Err(e) = self.context.signaling.stop_share(&self.context.room_id).await {
                    warn!(target: "mesh.tracks", error = %e, "Failed to release share");
                }
            }
        }
    }

    fn set_video(&mut self, video: OutboundVideo) {
        if let Some(media) = self.media.as_mut() {
            media.video = video;
        }
        self.publish();
    }

    /// Publish the current outbound set for links built from now on.
    fn publish(&self) {
        let tracks = self.media.as_ref().map(|media| OutboundTracks {
            audio: Arc::clone(&media.audio),
            video: Arc::clone(media.video.active()),
        });
        self.context.tracks.send_replace(tracks);
    }

    async fn substitute_video(&self, track: SharedTrack) {
        let track_id = track.id().to_string();
        match self.context.fanout.replace_outbound(MediaKind::Video, track).await {
            Ok(links) => {
                debug!(target: "mesh.tracks", track_id = %track_id, links, "Outbound video substituted");
            }
            Err(e) => {
                warn!(target: "mesh.tracks", track_id = %track_id, error = %e, "Outbound video substitution failed");
            }
        }
    }

    fn watch_screen(&self, screen: SharedTrack, generation: u64) {
        let mailbox = self.mailbox.clone();
        let cancel_token = self.cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                () = screen.ended() => {
                    if let Some(sender) = mailbox.upgrade() {
                        let _ = sender.send(TrackMessage::ScreenEnded { generation }).await;
                    }
                }
            }
        });
    }

    fn state(&self) -> LocalMediaState {
        match &self.media {
            None => LocalMediaState::default(),
            Some(media) => LocalMediaState {
                initialized: true,
                microphone_enabled: media.audio.is_enabled(),
                camera_enabled: self.camera_enabled,
                sharing: media.video.is_screen(),
                audio_track_id: Some(media.audio.id().to_string()),
                video_track_id: Some(media.video.active().id().to_string()),
            },
        }
    }

    fn release_devices(&mut self) {
        let Some(media) = self.media.take() else {
            return;
        };
        media.audio.stop();
        match media.video {
            OutboundVideo::Camera(camera) => camera.stop(),
            OutboundVideo::Screen { screen, parked_camera } => {
                screen.stop();
                parked_camera.stop();
            }
        }
        self.context.tracks.send_replace(None);
        debug!(target: "mesh.tracks", "Local media released");
    }
}

fn not_initialized() -> MeshError {
    MeshError::InvalidState("local media not initialized".to_string())
}
