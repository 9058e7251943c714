//! `SfuMeet` signaling protocol definitions
//!
//! Wire types shared by the server (`sfumeet-sfu`, `sfumeet-api`) and the
//! client orchestrator (`sfumeet-client`). Messages are JSON text frames:
//! kebab-case `type` tags, camelCase fields, optional `requestId` echoed on
//! the matching response.

pub mod ids;
pub mod media;
pub mod message;
pub mod rtp;

pub use ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
pub use media::{MediaKind, TransportDirection};
pub use message::{
    ClientEnvelope, ClientMessage, ConsumerDescriptor, ErrorCode, ProducerInfo, ServerEnvelope,
    ServerMessage, TransportDescriptor,
};
pub use rtp::{RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters};
