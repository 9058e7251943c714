//! Local media capture
//!
//! Capture is only ever started with explicit consent, expressed as
//! [`MediaOptions`]. Every acquired [`LocalTrack`] must be handed back to
//! [`MediaCapture::release`], otherwise the camera or microphone stays on.

use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sfumeet_proto::MediaKind;
use std::collections::HashSet;
use std::fmt;

/// What the user agreed to share
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaOptions {
    pub audio: bool,
    pub video: bool,
}

impl MediaOptions {
    /// Decline all local media
    #[must_use]
    pub const fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    #[must_use]
    pub const fn all() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    #[must_use]
    pub const fn video_only() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    #[must_use]
    pub const fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    /// Requested kinds, audio first
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(|kind| self.wants(*kind))
            .collect()
    }
}

/// One captured input track
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl fmt::Display for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Access to the local camera and microphone
#[async_trait::async_trait]
pub trait MediaCapture: Send + Sync {
    /// Start capturing every kind in `options`. Fails as a whole when one
    /// requested input is unavailable.
    async fn acquire(&self, options: MediaOptions) -> Result<Vec<LocalTrack>>;

    /// Stop a track; releasing an unknown track is a no-op
    fn release(&self, track: &LocalTrack);
}

/// Capture backed by synthetic inputs
///
/// Tracks carry no samples. Used for headless clients and tests; it keeps
/// the set of live tracks so leaks are observable.
pub struct SyntheticCapture {
    devices: MediaOptions,
    live: Mutex<HashSet<LocalTrack>>,
}

impl SyntheticCapture {
    /// Capture with a microphone and a camera
    #[must_use]
    pub fn new() -> Self {
        Self::with_devices(MediaOptions::all())
    }

    /// Capture with only the inputs enabled in `devices`
    #[must_use]
    pub fn with_devices(devices: MediaOptions) -> Self {
        Self {
            devices,
            live: Mutex::new(HashSet::new()),
        }
    }

    /// Tracks acquired and not yet released
    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.live.lock().len()
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(&self, options: MediaOptions) -> Result<Vec<LocalTrack>> {
        if let Some(missing) = options.kinds().into_iter().find(|k| !self.devices.wants(*k)) {
            return Err(ClientError::Capture(format!("no {missing} input device")));
        }

        let tracks: Vec<LocalTrack> = options
            .kinds()
            .into_iter()
            .map(|kind| LocalTrack {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
            })
            .collect();
        self.live.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    fn release(&self, track: &LocalTrack) {
        self.live.lock().remove(track);
    }
}
