//! Media kind and transport direction

use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Media kind carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Kind implied by a MIME type such as `audio/opus`
    #[must_use]
    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        let (major, _) = mime_type.split_once('/')?;
        match major.to_ascii_lowercase().as_str() {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<RTPCodecType> for MediaKind {
    type Error = RTPCodecType;

    fn try_from(codec_type: RTPCodecType) -> Result<Self, Self::Error> {
        match codec_type {
            RTPCodecType::Audio => Ok(Self::Audio),
            RTPCodecType::Video => Ok(Self::Video),
            other => Err(other),
        }
    }
}

impl From<MediaKind> for RTPCodecType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Video,
        }
    }
}

/// Direction of a peer transport, seen from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Peer sends media to the server (carries producers)
    Send,
    /// Peer receives media from the server (carries consumers)
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_mime_type() {
        assert_eq!(MediaKind::from_mime_type("audio/opus"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_mime_type("video/VP8"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime_type("application/json"), None);
        assert_eq!(MediaKind::from_mime_type("opus"), None);
    }

    #[test]
    fn test_kind_codec_type_conversion() {
        assert_eq!(MediaKind::try_from(RTPCodecType::Audio), Ok(MediaKind::Audio));
        assert!(MediaKind::try_from(RTPCodecType::Unspecified).is_err());
        assert_eq!(RTPCodecType::from(MediaKind::Video), RTPCodecType::Video);
    }
}
