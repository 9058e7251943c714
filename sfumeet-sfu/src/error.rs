//! Error types for the SFU core

use crate::engine::EngineError;
use sfumeet_proto::{ErrorCode, ProducerId, TransportId};
use thiserror::Error;

/// SFU error types
///
/// Every variant except [`Error::SessionClosed`] is reported to the single
/// peer whose request failed. None of them affect other sessions.
#[derive(Debug, Error)]
pub enum Error {
    /// Message arrived out of the required order; session state unchanged
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    /// The requester's capabilities cannot consume the producer
    #[error("Capability mismatch: cannot consume producer {producer_id}")]
    CapabilityMismatch { producer_id: ProducerId },

    /// The producer (or its owning session) is already closed
    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Transport creation failed: {0}")]
    TransportCreateFailed(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    /// The engine worker is gone; no new work is accepted
    #[error("Media engine unavailable: {0}")]
    EngineFatal(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The session started leaving while the operation was in flight.
    /// Whatever the operation created has been closed again.
    #[error("Peer session is closed")]
    SessionClosed,
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionNotMet(message.into())
    }

    /// Wire code for the requester, `None` when the failure must stay silent
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::PreconditionNotMet(_) => Some(ErrorCode::PreconditionNotMet),
            Self::CapabilityMismatch { .. } => Some(ErrorCode::CapabilityMismatch),
            Self::ProducerNotFound(_) => Some(ErrorCode::ProducerNotFound),
            Self::TransportNotFound(_) => Some(ErrorCode::TransportNotFound),
            Self::TransportCreateFailed(_) => Some(ErrorCode::TransportCreateFailed),
            Self::Engine(_) => Some(ErrorCode::EngineError),
            Self::EngineFatal(_) => Some(ErrorCode::EngineFatal),
            Self::CapacityExceeded(_) => Some(ErrorCode::CapacityExceeded),
            Self::SessionClosed => None,
        }
    }
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::WorkerDied => Self::EngineFatal("media engine worker died".to_string()),
            EngineError::UnknownTransport(id) => Self::TransportNotFound(id),
            EngineError::UnknownProducer(id) => Self::ProducerNotFound(id),
            EngineError::Rejected(msg) => Self::Engine(msg),
        }
    }
}

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_closed_is_silent() {
        assert_eq!(Error::SessionClosed.code(), None);
        assert_eq!(
            Error::precondition("no transport").code(),
            Some(ErrorCode::PreconditionNotMet)
        );
    }

    #[test]
    fn test_engine_error_mapping() {
        let err: Error = EngineError::WorkerDied.into();
        assert!(matches!(err, Error::EngineFatal(_)));

        let err: Error = EngineError::UnknownProducer(ProducerId::from("p")).into();
        assert!(matches!(err, Error::ProducerNotFound(id) if id.as_str() == "p"));

        let err: Error = EngineError::Rejected("bad codec".into()).into();
        assert_eq!(err.code(), Some(ErrorCode::EngineError));
    }
}
