//! Media engine boundary
//!
//! The SFU core never touches RTP, ICE or DTLS itself. It drives an engine
//! (one worker + one router, shared by every room) through [`MediaEngine`].
//! Close operations are idempotent and cascade the way a mediasoup-style
//! engine does: closing a transport closes everything carried on it, closing
//! a producer closes every consumer of it.

mod local;

pub use local::{EngineStats, LocalEngine, LocalEngineConfig};

use async_trait::async_trait;
use serde_json::Value;
use sfumeet_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportDescriptor, TransportDirection, TransportId,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The process-level worker failed; routing state is gone
    #[error("media engine worker died")]
    WorkerDied,

    #[error("unknown transport {0}")]
    UnknownTransport(TransportId),

    #[error("unknown producer {0}")]
    UnknownProducer(ProducerId),

    /// The engine refused the call (bad parameters, wrong direction, ...)
    #[error("{0}")]
    Rejected(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Capability negotiation, transport lifecycle and stream
/// production/consumption primitives of the external media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Router capabilities, fixed at process start
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Whether the worker is still running
    fn is_alive(&self) -> bool;

    /// Resolves once the worker has died
    async fn died(&self);

    async fn create_transport(
        &self,
        direction: TransportDirection,
    ) -> EngineResult<TransportDescriptor>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: Value,
    ) -> EngineResult<()>;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerId>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<ConsumerDescriptor>;

    async fn close_transport(&self, transport_id: &TransportId);

    async fn close_producer(&self, producer_id: &ProducerId);

    async fn close_consumer(&self, consumer_id: &ConsumerId);
}
