//! Outbound message sink of a peer session

use sfumeet_proto::ServerEnvelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trait for delivering server messages to one peer
///
/// Implemented by whatever carries the peer's signaling connection. A failed
/// send never affects the sender's caller beyond the returned error.
pub trait MessageSender: Send + Sync {
    fn send(&self, message: ServerEnvelope) -> Result<(), String>;
}

impl MessageSender for mpsc::UnboundedSender<ServerEnvelope> {
    fn send(&self, message: ServerEnvelope) -> Result<(), String> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|_| "Channel closed: peer disconnected".to_string())
    }
}

/// Bounded outbound queue of one connection
///
/// A peer that lets the queue fill up is disconnected instead of having
/// messages dropped: the first rejected send marks the sender overflowed and
/// every later send fails. The connection watches [`BoundedSender::overflowed`]
/// and closes, which runs the peer's regular leave path.
#[derive(Clone)]
pub struct BoundedSender {
    tx: mpsc::Sender<ServerEnvelope>,
    overflow: CancellationToken,
}

impl BoundedSender {
    #[must_use]
    pub fn new(tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self {
            tx,
            overflow: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }

    /// Resolves once a send found the queue full
    pub async fn overflowed(&self) {
        self.overflow.cancelled().await;
    }
}

impl MessageSender for BoundedSender {
    fn send(&self, message: ServerEnvelope) -> Result<(), String> {
        if self.overflow.is_cancelled() {
            return Err("Channel overflowed: connection closing".to_string());
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.overflow.cancel();
                "Channel full: closing connection of slow peer".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: peer disconnected".to_string()
            }
        })
    }
}
