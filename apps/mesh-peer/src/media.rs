use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually stopped the track.
    fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }
}

/// A set of tracks as handed to or received from the transport. Clones
/// share the underlying tracks.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaStream {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// The local capture stream, owned by the session for its whole lifetime.
///
/// Connections only read-attach [`stream`](Self::stream); the tracks are
/// stopped once, by [`release`](Self::release).
#[derive(Debug)]
pub struct LocalMediaSession {
    stream: MediaStream,
    released: AtomicBool,
}

impl LocalMediaSession {
    pub fn new(stream: MediaStream) -> Self {
        Self {
            stream,
            released: AtomicBool::new(false),
        }
    }

    pub fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.stream.tracks_of(TrackKind::Video) {
            track.set_enabled(enabled);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stops every track. Later calls do nothing and return 0.
    pub fn release(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let stopped = self.stream.tracks.iter().filter(|t| t.stop()).count();
        info!(stream = %self.stream.id, stopped, "local media released");
        stopped
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// May wait on a permission prompt; resolves to `Cancelled` once
    /// `cancel` fires.
    async fn acquire(
        &self,
        constraints: MediaConstraints,
        cancel: &CancellationToken,
    ) -> Result<LocalMediaSession, SessionError>;
}

/// In-process capture devices producing synthetic tracks.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDevices {
    label: String,
    grant_delay: Duration,
    deny: bool,
}

impl SyntheticDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    /// Simulates a permission prompt that takes `delay` to be answered.
    pub fn with_grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = delay;
        self
    }

    pub fn denying(mut self) -> Self {
        self.deny = true;
        self
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
        cancel: &CancellationToken,
    ) -> Result<LocalMediaSession, SessionError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = tokio::time::sleep(self.grant_delay) => {}
        }
        if self.deny {
            return Err(SessionError::MediaAcquisition(
                "camera/microphone permission denied".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(MediaTrack::new(
                format!("{}-audio", self.label),
                TrackKind::Audio,
            )));
        }
        if constraints.video {
            tracks.push(Arc::new(MediaTrack::new(
                format!("{}-video", self.label),
                TrackKind::Video,
            )));
        }
        debug!(label = %self.label, tracks = tracks.len(), "synthetic media acquired");
        Ok(LocalMediaSession::new(MediaStream::new(
            self.label.clone(),
            tracks,
        )))
    }
}
