//! Client end of the signaling channel

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use sfumeet_proto::{ClientEnvelope, ServerEnvelope};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Ordered, bidirectional message pipe to the signaling server
#[async_trait::async_trait]
pub trait ClientChannel: Send {
    async fn send(&mut self, message: ClientEnvelope) -> Result<()>;

    /// Next server message, `None` once the channel is closed
    async fn recv(&mut self) -> Option<Result<ServerEnvelope>>;

    async fn close(&mut self);
}

/// In-process channel, e.g. the client halves of a server `ChannelStream`
pub struct MemoryChannel {
    outgoing: Option<mpsc::UnboundedSender<ClientEnvelope>>,
    incoming: mpsc::UnboundedReceiver<ServerEnvelope>,
}

impl MemoryChannel {
    #[must_use]
    pub const fn new(
        outgoing: mpsc::UnboundedSender<ClientEnvelope>,
        incoming: mpsc::UnboundedReceiver<ServerEnvelope>,
    ) -> Self {
        Self {
            outgoing: Some(outgoing),
            incoming,
        }
    }
}

#[async_trait::async_trait]
impl ClientChannel for MemoryChannel {
    async fn send(&mut self, message: ClientEnvelope) -> Result<()> {
        let outgoing = self.outgoing.as_ref().ok_or(ClientError::ChannelClosed)?;
        outgoing
            .send(message)
            .map_err(|_| ClientError::ChannelClosed)
    }

    async fn recv(&mut self) -> Option<Result<ServerEnvelope>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        // Dropping the sender is the disconnect
        self.outgoing = None;
    }
}

/// JSON text frames over a WebSocket connection
pub struct WebSocketChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketChannel {
    /// Connect to a signaling endpoint such as `ws://host:port/ws?roomId=r1`
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, response) = connect_async(url).await?;
        debug!(url, status = %response.status(), "Signaling connection established");
        Ok(Self { stream })
    }
}

#[async_trait::async_trait]
impl ClientChannel for WebSocketChannel {
    async fn send(&mut self, message: ClientEnvelope) -> Result<()> {
        let text = serde_json::to_string(&message)?;
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerEnvelope>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(e.into())),
            };
            match frame {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).map_err(Into::into))
                }
                Message::Binary(data) => {
                    return Some(serde_json::from_slice(&data).map_err(Into::into))
                }
                Message::Close(frame) => {
                    debug!(?frame, "Signaling connection closed by server");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            warn!(error = %e, "Failed to close signaling connection");
        }
    }
}
