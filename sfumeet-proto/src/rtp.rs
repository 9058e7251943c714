//! RTP capability and parameter shapes exchanged during negotiation
//!
//! Only the fields the signaling core reasons about are typed (kind, MIME
//! type, clock rate, channels). Everything else the media engine needs is
//! carried through untouched as JSON.

use crate::media::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};

/// One codec a router or device is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    pub fn new(kind: MediaKind, mime_type: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            preferred_payload_type: None,
            clock_rate,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    /// Opus, 48 kHz stereo
    #[must_use]
    pub fn opus() -> Self {
        Self::new(MediaKind::Audio, MIME_TYPE_OPUS, 48000).with_channels(2)
    }

    /// VP8, 90 kHz
    #[must_use]
    pub fn vp8() -> Self {
        Self::new(MediaKind::Video, MIME_TYPE_VP8, 90000)
    }

    /// H264, 90 kHz
    #[must_use]
    pub fn h264() -> Self {
        Self::new(MediaKind::Video, MIME_TYPE_H264, 90000)
    }

    /// Two codecs match when kind, MIME type (case-insensitive), clock rate
    /// and channel count agree. Format parameters are not compared.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }

    /// Whether a concrete codec from RTP parameters is covered by this capability
    #[must_use]
    pub fn covers(&self, codec: &RtpCodecParameters) -> bool {
        self.mime_type.eq_ignore_ascii_case(&codec.mime_type)
            && self.clock_rate == codec.clock_rate
            && self.channels.unwrap_or(1) == codec.channels.unwrap_or(1)
    }
}

/// Capability set of a router or a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    #[must_use]
    pub const fn new(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            codecs,
            header_extensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    pub fn codecs_of(&self, kind: MediaKind) -> impl Iterator<Item = &RtpCodecCapability> {
        self.codecs.iter().filter(move |c| c.kind == kind)
    }

    #[must_use]
    pub fn supports_kind(&self, kind: MediaKind) -> bool {
        self.codecs_of(kind).next().is_some()
    }

    /// Whether any capability covers the given codec
    #[must_use]
    pub fn covers(&self, codec: &RtpCodecParameters) -> bool {
        self.codecs.iter().any(|c| c.covers(codec))
    }

    /// Codecs of `self` that `other` can also handle. Entries keep the
    /// payload types and feedback of `self`.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let codecs = self
            .codecs
            .iter()
            .filter(|codec| other.codecs.iter().any(|c| c.matches(codec)))
            .cloned()
            .collect();
        Self {
            codecs,
            header_extensions: self.header_extensions.clone(),
        }
    }
}

/// A concrete codec chosen for a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl RtpCodecParameters {
    /// Concrete parameters for a capability, using `payload_type` unless the
    /// capability prefers one
    #[must_use]
    pub fn from_capability(capability: &RtpCodecCapability, payload_type: u8) -> Self {
        Self {
            mime_type: capability.mime_type.clone(),
            payload_type: capability.preferred_payload_type.unwrap_or(payload_type),
            clock_rate: capability.clock_rate,
            channels: capability.channels,
            parameters: capability.parameters.clone(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime_type(&self.mime_type)
    }
}

/// RTP parameters describing one produced or consumed stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

impl RtpParameters {
    #[must_use]
    pub fn with_codec(codec: RtpCodecParameters) -> Self {
        Self {
            codecs: vec![codec],
            ..Self::default()
        }
    }

    /// The codec actually used for media (first entry)
    #[must_use]
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_matching_ignores_mime_case() {
        let mut upper = RtpCodecCapability::vp8();
        upper.mime_type = "VIDEO/VP8".to_string();
        assert!(RtpCodecCapability::vp8().matches(&upper));
        assert!(!RtpCodecCapability::vp8().matches(&RtpCodecCapability::h264()));
    }

    #[test]
    fn test_channel_count_must_agree() {
        let mono = RtpCodecCapability::new(MediaKind::Audio, "audio/opus", 48000);
        assert!(!RtpCodecCapability::opus().matches(&mono));
    }

    #[test]
    fn test_capabilities_cover_parameters() {
        let caps = RtpCapabilities::new(vec![RtpCodecCapability::opus()]);
        let opus = RtpCodecParameters::from_capability(&RtpCodecCapability::opus(), 100);
        let vp8 = RtpCodecParameters::from_capability(&RtpCodecCapability::vp8(), 101);
        assert!(caps.covers(&opus));
        assert!(!caps.covers(&vp8));
        assert!(caps.supports_kind(MediaKind::Audio));
        assert!(!caps.supports_kind(MediaKind::Video));
    }

    #[test]
    fn test_intersect_keeps_router_payload_types() {
        let mut router_opus = RtpCodecCapability::opus();
        router_opus.preferred_payload_type = Some(100);
        let router = RtpCapabilities::new(vec![router_opus, RtpCodecCapability::vp8()]);
        let device = RtpCapabilities::new(vec![RtpCodecCapability::opus(), RtpCodecCapability::h264()]);

        let common = router.intersect(&device);
        assert_eq!(common.codecs.len(), 1);
        assert_eq!(common.codecs[0].preferred_payload_type, Some(100));
        assert!(!common.supports_kind(MediaKind::Video));
    }

    #[test]
    fn test_parameters_use_camel_case() {
        let params = RtpParameters::with_codec(RtpCodecParameters::from_capability(
            &RtpCodecCapability::opus(),
            111,
        ));
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["codecs"][0]["mimeType"], "audio/opus");
        assert_eq!(json["codecs"][0]["payloadType"], 111);
        assert_eq!(json["codecs"][0]["clockRate"], 48000);
    }
}
