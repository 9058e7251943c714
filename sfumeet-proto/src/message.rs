//! Signaling messages
//!
//! Requests travel client → server inside a [`ClientEnvelope`]; responses and
//! server pushes travel back inside a [`ServerEnvelope`]. A response echoes
//! the request's `requestId`; pushes (`new-producer`, `producer-closed`,
//! `peer-disconnected`) never carry one.

use crate::ids::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};
use crate::media::{MediaKind, TransportDirection};
use crate::rtp::{RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Peer → server requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: RoomId },
    GetRouterCapabilities,
    CreateTransport { direction: TransportDirection },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    GetProducers,
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    LeaveRoom,
}

impl ClientMessage {
    /// Wire tag, used in logs and error reports
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::GetRouterCapabilities => "get-router-capabilities",
            Self::CreateTransport { .. } => "create-transport",
            Self::ConnectTransport { .. } => "connect-transport",
            Self::Produce { .. } => "produce",
            Self::GetProducers => "get-producers",
            Self::Consume { .. } => "consume",
            Self::LeaveRoom => "leave-room",
        }
    }
}

/// Client request with optional correlation id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

impl ClientEnvelope {
    #[must_use]
    pub const fn new(message: ClientMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    #[must_use]
    pub const fn request(request_id: u64, message: ClientMessage) -> Self {
        Self {
            request_id: Some(request_id),
            message,
        }
    }
}

/// Everything a peer needs to build its side of a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
}

/// A producer visible to other room members
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
}

/// Everything a peer needs to build its side of a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Stable error codes reported to the requesting peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    PreconditionNotMet,
    CapabilityMismatch,
    ProducerNotFound,
    TransportNotFound,
    TransportCreateFailed,
    EngineError,
    EngineFatal,
    CapacityExceeded,
    InvalidMessage,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PreconditionNotMet => "precondition-not-met",
            Self::CapabilityMismatch => "capability-mismatch",
            Self::ProducerNotFound => "producer-not-found",
            Self::TransportNotFound => "transport-not-found",
            Self::TransportCreateFailed => "transport-create-failed",
            Self::EngineError => "engine-error",
            Self::EngineFatal => "engine-fatal",
            Self::CapacityExceeded => "capacity-exceeded",
            Self::InvalidMessage => "invalid-message",
        };
        f.write_str(s)
    }
}

/// Server → peer responses and pushes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined { peer_id: PeerId, room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    RouterCapabilities { rtp_capabilities: RtpCapabilities },
    TransportCreatedSend(TransportDescriptor),
    TransportCreatedRecv(TransportDescriptor),
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: ProducerId, kind: MediaKind },
    Producers { producers: Vec<ProducerInfo> },
    Consumed(ConsumerDescriptor),
    NewProducer(ProducerInfo),
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PeerDisconnected { peer_id: PeerId },
    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    #[must_use]
    pub const fn transport_created(direction: TransportDirection, descriptor: TransportDescriptor) -> Self {
        match direction {
            TransportDirection::Send => Self::TransportCreatedSend(descriptor),
            TransportDirection::Recv => Self::TransportCreatedRecv(descriptor),
        }
    }

    /// Whether this message is an unsolicited server push
    #[must_use]
    pub const fn is_push(&self) -> bool {
        matches!(
            self,
            Self::NewProducer(_) | Self::ProducerClosed { .. } | Self::PeerDisconnected { .. }
        )
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::RouterCapabilities { .. } => "router-capabilities",
            Self::TransportCreatedSend(_) => "transport-created-send",
            Self::TransportCreatedRecv(_) => "transport-created-recv",
            Self::TransportConnected { .. } => "transport-connected",
            Self::Produced { .. } => "produced",
            Self::Producers { .. } => "producers",
            Self::Consumed(_) => "consumed",
            Self::NewProducer(_) => "new-producer",
            Self::ProducerClosed { .. } => "producer-closed",
            Self::PeerDisconnected { .. } => "peer-disconnected",
            Self::Error { .. } => "error",
        }
    }
}

/// Server message with the correlation id of the request it answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    #[must_use]
    pub const fn push(message: ServerMessage) -> Self {
        Self {
            request_id: None,
            message,
        }
    }

    #[must_use]
    pub const fn reply(request_id: Option<u64>, message: ServerMessage) -> Self {
        Self {
            request_id,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_request_wire_format() {
        let raw = json!({
            "requestId": 7,
            "type": "create-transport",
            "direction": "send"
        });
        let envelope: ClientEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.request_id, Some(7));
        assert_eq!(
            envelope.message,
            ClientMessage::CreateTransport {
                direction: TransportDirection::Send
            }
        );
    }

    #[test]
    fn test_unit_requests_need_only_a_type() {
        let envelope: ClientEnvelope =
            serde_json::from_str(r#"{"type":"get-router-capabilities"}"#).unwrap();
        assert_eq!(envelope.request_id, None);
        assert_eq!(envelope.message, ClientMessage::GetRouterCapabilities);
    }

    #[test]
    fn test_transport_created_tag_carries_direction() {
        let descriptor = TransportDescriptor {
            id: TransportId::from("t1"),
            ice_parameters: json!({"usernameFragment": "u"}),
            ice_candidates: vec![],
            dtls_parameters: json!({"role": "auto"}),
        };
        let message = ServerMessage::transport_created(TransportDirection::Recv, descriptor);
        let json = serde_json::to_value(ServerEnvelope::reply(Some(3), message)).unwrap();
        assert_eq!(json["type"], "transport-created-recv");
        assert_eq!(json["requestId"], 3);
        assert_eq!(json["id"], "t1");
        assert_eq!(json["iceParameters"]["usernameFragment"], "u");
    }

    #[test]
    fn test_pushes_have_no_request_id() {
        let push = ServerEnvelope::push(ServerMessage::PeerDisconnected {
            peer_id: PeerId::from("p1"),
        });
        assert!(push.message.is_push());
        let json = serde_json::to_value(&push).unwrap();
        assert_eq!(json, json!({"type": "peer-disconnected", "peerId": "p1"}));
    }

    #[test]
    fn test_error_code_serialization() {
        let message = ServerMessage::Error {
            code: ErrorCode::ProducerNotFound,
            message: "gone".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["code"], "producer-not-found");
        assert_eq!(ErrorCode::ProducerNotFound.to_string(), "producer-not-found");
    }
}
