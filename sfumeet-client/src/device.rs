//! Client side of the media engine
//!
//! A [`ClientEngine`] is the peer's counterpart of the server's media
//! engine: it loads the router capabilities into a device, builds the local
//! half of each transport and turns captured tracks into RTP parameters.

use crate::capture::LocalTrack;
use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use sfumeet_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportDescriptor, TransportDirection, TransportId,
};
use std::collections::{HashMap, HashSet};

/// Received media bound to a local consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
}

#[async_trait::async_trait]
pub trait ClientEngine: Send + Sync {
    /// Load the router capabilities and return the device capability set:
    /// the router codecs this device can also handle
    fn load(&self, router: &RtpCapabilities) -> Result<RtpCapabilities>;

    /// Build the local half of a server transport.
    ///
    /// Returns the DTLS parameters to relay back in `connect-transport`.
    async fn create_transport(
        &self,
        direction: TransportDirection,
        descriptor: &TransportDescriptor,
    ) -> Result<Value>;

    /// RTP parameters for sending `track` over the send transport
    async fn produce(&self, transport_id: &TransportId, track: &LocalTrack)
        -> Result<RtpParameters>;

    /// Bind a server consumer to the receive transport
    async fn consume(
        &self,
        transport_id: &TransportId,
        consumer: &ConsumerDescriptor,
    ) -> Result<RemoteTrack>;

    fn close_producer(&self, track: &LocalTrack);

    fn close_consumer(&self, consumer_id: &ConsumerId);

    /// Close a transport and everything carried on it
    fn close_transport(&self, transport_id: &TransportId);
}

/// Open objects of a [`BasicDevice`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl DeviceCounts {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.transports == 0 && self.producers == 0 && self.consumers == 0
    }
}

#[derive(Default)]
struct DeviceState {
    capabilities: Option<RtpCapabilities>,
    transports: HashMap<TransportId, TransportDirection>,
    // track id -> transport
    producers: HashMap<String, TransportId>,
    consumers: HashMap<ConsumerId, TransportId>,
}

/// Bookkeeping device
///
/// Negotiates against a fixed native codec list and tracks every object it
/// hands out, without moving any media.
pub struct BasicDevice {
    native: RtpCapabilities,
    state: Mutex<DeviceState>,
}

impl BasicDevice {
    #[must_use]
    pub fn new(native: RtpCapabilities) -> Self {
        Self {
            native,
            state: Mutex::new(DeviceState::default()),
        }
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.state.lock().capabilities.is_some()
    }

    #[must_use]
    pub fn counts(&self) -> DeviceCounts {
        let state = self.state.lock();
        DeviceCounts {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    fn dtls_parameters() -> Value {
        let digest = uuid::Uuid::new_v4()
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        json!({
            "role": "client",
            "fingerprints": [{ "algorithm": "sha-256", "value": digest }],
        })
    }
}

impl Default for BasicDevice {
    /// Opus and VP8
    fn default() -> Self {
        Self::new(RtpCapabilities::new(vec![
            RtpCodecCapability::opus(),
            RtpCodecCapability::vp8(),
        ]))
    }
}

#[async_trait::async_trait]
impl ClientEngine for BasicDevice {
    fn load(&self, router: &RtpCapabilities) -> Result<RtpCapabilities> {
        let mut state = self.state.lock();
        if let Some(loaded) = &state.capabilities {
            return Ok(loaded.clone());
        }
        let capabilities = router.intersect(&self.native);
        if capabilities.is_empty() {
            return Err(ClientError::Device(
                "no router codec is supported by this device".to_string(),
            ));
        }
        state.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
        descriptor: &TransportDescriptor,
    ) -> Result<Value> {
        let mut state = self.state.lock();
        if state.capabilities.is_none() {
            return Err(ClientError::Device("device not loaded".to_string()));
        }
        if state.transports.contains_key(&descriptor.id) {
            return Err(ClientError::Device(format!(
                "transport {} already exists",
                descriptor.id
            )));
        }
        state.transports.insert(descriptor.id.clone(), direction);
        Ok(Self::dtls_parameters())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        track: &LocalTrack,
    ) -> Result<RtpParameters> {
        let mut state = self.state.lock();
        match state.transports.get(transport_id) {
            Some(TransportDirection::Send) => {}
            Some(TransportDirection::Recv) => {
                return Err(ClientError::Device(format!(
                    "transport {transport_id} cannot send"
                )))
            }
            None => {
                return Err(ClientError::Device(format!(
                    "unknown transport {transport_id}"
                )))
            }
        }
        let codec = state
            .capabilities
            .as_ref()
            .and_then(|caps| caps.codecs_of(track.kind).next())
            .ok_or_else(|| ClientError::Device(format!("device cannot send {}", track.kind)))?;
        let parameters = RtpParameters::with_codec(RtpCodecParameters::from_capability(codec, 96));

        state
            .producers
            .insert(track.id.clone(), transport_id.clone());
        Ok(parameters)
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        consumer: &ConsumerDescriptor,
    ) -> Result<RemoteTrack> {
        let mut state = self.state.lock();
        if state.transports.get(transport_id) != Some(&TransportDirection::Recv) {
            return Err(ClientError::Device(format!(
                "transport {transport_id} cannot receive"
            )));
        }
        let codec = consumer
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| ClientError::Device("consumer carries no codec".to_string()))?;
        let decodable = state
            .capabilities
            .as_ref()
            .is_some_and(|caps| caps.covers(codec));
        if !decodable {
            return Err(ClientError::Device(format!(
                "cannot decode {}",
                codec.mime_type
            )));
        }

        state
            .consumers
            .insert(consumer.consumer_id.clone(), transport_id.clone());
        Ok(RemoteTrack {
            consumer_id: consumer.consumer_id.clone(),
            producer_id: consumer.producer_id.clone(),
            kind: consumer.kind,
        })
    }

    fn close_producer(&self, track: &LocalTrack) {
        self.state.lock().producers.remove(&track.id);
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }

    fn close_transport(&self, transport_id: &TransportId) {
        let mut state = self.state.lock();
        if state.transports.remove(transport_id).is_none() {
            return;
        }
        state.producers.retain(|_, t| t != transport_id);
        state.consumers.retain(|_, t| t != transport_id);
    }
}
