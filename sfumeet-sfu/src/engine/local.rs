//! In-process media engine
//!
//! Keeps the engine-side bookkeeping (transports, producers, consumers and
//! their close cascades) without moving any media. Used by the server binary
//! when no external engine is attached, and by the tests to detect leaked
//! engine resources.

use super::{EngineError, EngineResult, MediaEngine};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sfumeet_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportDescriptor, TransportDirection, TransportId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use webrtc::ice::rand::{generate_pwd, generate_ufrag};

/// First dynamic payload type handed out to router codecs
const FIRST_PAYLOAD_TYPE: u8 = 100;

/// Listen settings of the local engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEngineConfig {
    pub listen_ip: String,
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub codecs: Vec<RtpCodecCapability>,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            listen_ip: "127.0.0.1".to_string(),
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 10000,
            rtc_max_port: 20000,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            codecs: vec![RtpCodecCapability::opus(), RtpCodecCapability::vp8()],
        }
    }
}

/// Live engine object counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

struct LocalTransport {
    direction: TransportDirection,
    connected: bool,
}

struct LocalProducer {
    transport_id: TransportId,
    kind: MediaKind,
    codec: RtpCodecParameters,
}

struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
}

impl EngineState {
    fn remove_producer(&mut self, producer_id: &ProducerId) {
        if self.producers.remove(producer_id).is_some() {
            self.consumers.retain(|_, c| &c.producer_id != producer_id);
        }
    }

    fn remove_transport(&mut self, transport_id: &TransportId) {
        if self.transports.remove(transport_id).is_none() {
            return;
        }
        let carried: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &carried {
            self.remove_producer(producer_id);
        }
        self.consumers.retain(|_, c| &c.transport_id != transport_id);
    }
}

/// Bookkeeping-only [`MediaEngine`]
pub struct LocalEngine {
    config: LocalEngineConfig,
    capabilities: RtpCapabilities,
    fingerprint: String,
    state: Mutex<EngineState>,
    next_port: AtomicU32,
    next_mid: AtomicU32,
    died: CancellationToken,
}

impl LocalEngine {
    #[must_use]
    pub fn new(config: LocalEngineConfig) -> Self {
        let capabilities = router_capabilities(&config.codecs);
        info!(
            codecs = capabilities.codecs.len(),
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            "Local media engine created"
        );
        Self {
            config,
            capabilities,
            fingerprint: generate_fingerprint(),
            state: Mutex::new(EngineState::default()),
            next_port: AtomicU32::new(0),
            next_mid: AtomicU32::new(0),
            died: CancellationToken::new(),
        }
    }

    /// Simulate a worker crash. Every live object is dropped and all
    /// further calls fail with [`EngineError::WorkerDied`].
    pub fn kill(&self) {
        error!("Local media engine worker killed");
        *self.state.lock() = EngineState::default();
        self.died.cancel();
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let state = self.state.lock();
        EngineStats {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.died.is_cancelled() {
            Err(EngineError::WorkerDied)
        } else {
            Ok(())
        }
    }

    fn allocate_port(&self) -> u16 {
        let min = u32::from(self.config.rtc_min_port);
        let span = u32::from(self.config.rtc_max_port).saturating_sub(min) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        u16::try_from(min + offset).unwrap_or(self.config.rtc_max_port)
    }

    fn ice_candidates(&self, port: u16) -> Vec<Value> {
        let mut candidates = Vec::new();
        let (udp_priority, tcp_priority) = if self.config.prefer_udp {
            (1_076_302_079_u32, 1_076_276_479_u32)
        } else {
            (1_076_276_479, 1_076_302_079)
        };
        if self.config.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": udp_priority,
                "ip": self.config.announced_ip,
                "address": self.config.announced_ip,
                "protocol": "udp",
                "port": port,
                "type": "host",
            }));
        }
        if self.config.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": tcp_priority,
                "ip": self.config.announced_ip,
                "address": self.config.announced_ip,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive",
            }));
        }
        candidates
    }

    /// Router codec able to carry `codec` and also accepted by `caps`
    fn negotiated_codec(
        &self,
        codec: &RtpCodecParameters,
        caps: &RtpCapabilities,
    ) -> Option<&RtpCodecCapability> {
        self.capabilities
            .codecs
            .iter()
            .find(|router| router.covers(codec) && caps.codecs.iter().any(|c| c.matches(router)))
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(LocalEngineConfig::default())
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock();
        state
            .producers
            .get(producer_id)
            .is_some_and(|p| self.negotiated_codec(&p.codec, rtp_capabilities).is_some())
    }

    fn is_alive(&self) -> bool {
        !self.died.is_cancelled()
    }

    async fn died(&self) {
        self.died.cancelled().await;
    }

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> EngineResult<TransportDescriptor> {
        self.ensure_alive()?;
        let id = TransportId::generate();
        let port = self.allocate_port();
        let descriptor = TransportDescriptor {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": generate_ufrag(),
                "password": generate_pwd(),
                "iceLite": true,
            }),
            ice_candidates: self.ice_candidates(port),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": self.fingerprint }],
            }),
        };
        self.state.lock().transports.insert(
            id.clone(),
            LocalTransport {
                direction,
                connected: false,
            },
        );
        debug!(transport_id = %id, direction = %direction, port, "Engine transport created");
        Ok(descriptor)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> EngineResult<()> {
        self.ensure_alive()?;
        if !dtls_parameters.is_object() {
            return Err(EngineError::Rejected(
                "dtlsParameters must be an object".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        if transport.connected {
            return Err(EngineError::Rejected(format!(
                "connect() already called on transport {transport_id}"
            )));
        }
        transport.connected = true;
        debug!(transport_id = %transport_id, "Engine transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerId> {
        self.ensure_alive()?;
        let codec = rtp_parameters
            .primary_codec()
            .cloned()
            .ok_or_else(|| EngineError::Rejected("rtpParameters carry no codec".to_string()))?;
        if codec.kind() != Some(kind) {
            return Err(EngineError::Rejected(format!(
                "codec {} does not carry {kind}",
                codec.mime_type
            )));
        }
        if !self.capabilities.covers(&codec) {
            return Err(EngineError::Rejected(format!(
                "codec {} is not supported by the router",
                codec.mime_type
            )));
        }

        let mut state = self.state.lock();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} cannot carry producers"
            )));
        }
        let id = ProducerId::generate();
        state.producers.insert(
            id.clone(),
            LocalProducer {
                transport_id: transport_id.clone(),
                kind,
                codec,
            },
        );
        debug!(producer_id = %id, kind = %kind, "Engine producer created");
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<ConsumerDescriptor> {
        self.ensure_alive()?;
        let mut state = self.state.lock();
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::UnknownTransport(transport_id.clone()))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} cannot carry consumers"
            )));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownProducer(producer_id.clone()))?;
        let kind = producer.kind;
        let router_codec = self
            .negotiated_codec(&producer.codec, rtp_capabilities)
            .ok_or_else(|| {
                EngineError::Rejected(format!("cannot consume producer {producer_id}"))
            })?;

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let ssrc = uuid::Uuid::new_v4().as_u128() as u32;
        let mut rtp_parameters = RtpParameters::with_codec(RtpCodecParameters::from_capability(
            router_codec,
            FIRST_PAYLOAD_TYPE,
        ));
        rtp_parameters.mid = Some(mid.to_string());
        rtp_parameters.encodings = vec![json!({ "ssrc": ssrc })];

        let consumer_id = ConsumerId::generate();
        state.consumers.insert(
            consumer_id.clone(),
            LocalConsumer {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
            },
        );
        debug!(consumer_id = %consumer_id, producer_id = %producer_id, "Engine consumer created");
        Ok(ConsumerDescriptor {
            consumer_id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        self.state.lock().remove_transport(transport_id);
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.state.lock().remove_producer(producer_id);
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.lock().consumers.remove(consumer_id);
    }
}

/// Router capabilities for the configured codecs, with payload types assigned
fn router_capabilities(codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let codecs = codecs
        .iter()
        .zip(FIRST_PAYLOAD_TYPE..)
        .map(|(codec, payload_type)| {
            let mut codec = codec.clone();
            codec.preferred_payload_type.get_or_insert(payload_type);
            if codec.kind == MediaKind::Video && codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = vec![
                    json!({ "type": "nack" }),
                    json!({ "type": "nack", "parameter": "pli" }),
                    json!({ "type": "ccm", "parameter": "fir" }),
                    json!({ "type": "goog-remb" }),
                ];
            }
            codec
        })
        .collect();
    RtpCapabilities::new(codecs)
}

/// SHA-256 style fingerprint, one per engine instance
fn generate_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
