//! Error types for the client orchestrator

use sfumeet_proto::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Signaling channel error: {0}")]
    Channel(String),

    #[error("Signaling channel closed")]
    ChannelClosed,

    /// The server answered the request with an error
    #[error("{request} rejected ({code}): {message}")]
    Server {
        request: &'static str,
        code: ErrorCode,
        message: String,
    },

    #[error("Unexpected {reply} reply to {request}")]
    UnexpectedReply {
        request: &'static str,
        reply: &'static str,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Media capture failed: {0}")]
    Capture(String),

    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Wire code when the server rejected the request
    #[must_use]
    pub const fn server_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
