//! Signaling channel
//!
//! Architecture:
//! - JSON encoding/decoding of envelopes (`JsonCodec`)
//! - Transport-agnostic IO via the `StreamMessage` trait
//! - One `SignalingHandler` per connection: a reader loop plus an ordered
//!   worker, so requests are processed strictly in arrival order while a
//!   disconnect is acted upon immediately
//! - Every request is resolved against the `RoomDirectory`; failures are
//!   reported to the requesting peer only

use parking_lot::Mutex;
use sfumeet_proto::{
    ClientEnvelope, ClientMessage, ErrorCode, PeerId, RoomId, ServerEnvelope, ServerMessage,
};
use sfumeet_sfu::{Error, MessageSender, RoomDirectory};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// JSON codec for signaling envelopes
pub struct JsonCodec;

impl JsonCodec {
    pub fn decode_client_message(text: &str) -> Result<ClientEnvelope, String> {
        serde_json::from_str(text).map_err(|e| format!("Invalid client message: {e}"))
    }

    pub fn encode_server_message(message: &ServerEnvelope) -> Result<String, String> {
        serde_json::to_string(message).map_err(|e| format!("Failed to encode server message: {e}"))
    }
}

/// Unified IO abstraction for one signaling connection
#[async_trait::async_trait]
pub trait StreamMessage: Send + Sync {
    /// Receive a client message
    ///
    /// Returns None when the connection is closed, `Some(Err)` for a frame
    /// that could not be decoded
    async fn recv(&mut self) -> Option<Result<ClientEnvelope, String>>;

    /// Send a server message
    fn send(&self, message: ServerEnvelope) -> Result<(), String>;

    /// Sink handed to the peer session for replies and pushes
    fn sender(&self) -> Arc<dyn MessageSender>;

    /// Check if connection is still alive
    fn is_alive(&self) -> bool;
}

/// In-memory signaling connection
pub struct ChannelStream {
    incoming: mpsc::UnboundedReceiver<ClientEnvelope>,
    outgoing: mpsc::UnboundedSender<ServerEnvelope>,
}

impl ChannelStream {
    /// Server end plus the client's halves of the connection
    #[must_use]
    pub fn pair() -> (
        Self,
        mpsc::UnboundedSender<ClientEnvelope>,
        mpsc::UnboundedReceiver<ServerEnvelope>,
    ) {
        let (client_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, client_rx) = mpsc::unbounded_channel();
        (Self { incoming, outgoing }, client_tx, client_rx)
    }
}

#[async_trait::async_trait]
impl StreamMessage for ChannelStream {
    async fn recv(&mut self) -> Option<Result<ClientEnvelope, String>> {
        self.incoming.recv().await.map(Ok)
    }

    fn send(&self, message: ServerEnvelope) -> Result<(), String> {
        MessageSender::send(&self.outgoing, message)
    }

    fn sender(&self) -> Arc<dyn MessageSender> {
        Arc::new(self.outgoing.clone())
    }

    fn is_alive(&self) -> bool {
        !self.outgoing.is_closed()
    }
}

/// Room membership of one connection
///
/// `Left` is terminal: after `leave-room` or a disconnect the connection
/// never joins again and its requests go unanswered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Membership {
    #[default]
    NotJoined,
    Joined(RoomId),
    Left,
}

impl Membership {
    /// Mark the connection as left, returning the room it was in
    fn leave(&mut self) -> Option<RoomId> {
        match std::mem::replace(self, Self::Left) {
            Self::Joined(room_id) => Some(room_id),
            Self::NotJoined | Self::Left => None,
        }
    }
}

/// Per-connection signaling handler
///
/// Owns the connection-scoped peer id and the room the connection joined.
/// External code creates one per connection and calls [`SignalingHandler::run`].
#[derive(Clone)]
pub struct SignalingHandler {
    directory: Arc<RoomDirectory>,
    peer_id: PeerId,
    membership: Arc<Mutex<Membership>>,
    disconnected: CancellationToken,
}

impl SignalingHandler {
    #[must_use]
    pub fn new(directory: Arc<RoomDirectory>) -> Self {
        Self {
            directory,
            peer_id: PeerId::generate(),
            membership: Arc::new(Mutex::new(Membership::NotJoined)),
            disconnected: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub fn room_id(&self) -> Option<RoomId> {
        match &*self.membership.lock() {
            Membership::Joined(room_id) => Some(room_id.clone()),
            Membership::NotJoined | Membership::Left => None,
        }
    }

    /// True once the connection left its room or disconnected
    #[must_use]
    pub fn has_left(&self) -> bool {
        *self.membership.lock() == Membership::Left
    }

    /// Run the connection until the peer disconnects.
    ///
    /// With `initial_room`, the connection joins that room before any
    /// message is read.
    pub async fn run<S: StreamMessage>(&self, stream: &mut S, initial_room: Option<RoomId>) {
        let sender = stream.sender();
        let (queue, mut requests) = mpsc::unbounded_channel::<ClientEnvelope>();

        let worker = {
            let handler = self.clone();
            let sender = Arc::clone(&sender);
            tokio::spawn(async move {
                while let Some(envelope) = requests.recv().await {
                    if handler.disconnected.is_cancelled() {
                        debug!(peer_id = %handler.peer_id, "Dropping request after disconnect");
                        continue;
                    }
                    if let Some(reply) = handler.handle(envelope, &sender).await {
                        if let Err(e) = sender.send(reply) {
                            debug!(peer_id = %handler.peer_id, error = %e, "Failed to send reply");
                        }
                    }
                }
            })
        };

        if let Some(room_id) = initial_room {
            let _ = queue.send(ClientEnvelope::new(ClientMessage::JoinRoom { room_id }));
        }

        loop {
            tokio::select! {
                incoming = stream.recv() => {
                    match incoming {
                        Some(Ok(envelope)) => {
                            if queue.send(envelope).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(peer_id = %self.peer_id, error = %e, "Undecodable message");
                            let reply = ServerEnvelope::push(ServerMessage::Error {
                                code: ErrorCode::InvalidMessage,
                                message: e,
                            });
                            if stream.send(reply).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!(peer_id = %self.peer_id, "Client disconnected");
                            break;
                        }
                    }
                }

                // Heartbeat/health check every 30 seconds
                () = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                    if !stream.is_alive() {
                        info!(peer_id = %self.peer_id, "Connection no longer alive");
                        break;
                    }
                }
            }
        }

        // Leave right away; the worker may still be waiting on the engine
        self.disconnect().await;
        drop(queue);
        if let Err(e) = worker.await {
            warn!(peer_id = %self.peer_id, error = %e, "Signaling worker failed");
        }
    }

    async fn disconnect(&self) {
        self.disconnected.cancel();
        let room_id = self.membership.lock().leave();
        if let Some(room_id) = room_id {
            self.directory.leave(&room_id, &self.peer_id).await;
        }
    }

    /// Process one request; returns the reply, if any
    pub async fn handle(
        &self,
        envelope: ClientEnvelope,
        sender: &Arc<dyn MessageSender>,
    ) -> Option<ServerEnvelope> {
        let ClientEnvelope {
            request_id,
            message,
        } = envelope;
        let name = message.name();
        match self.dispatch(message, sender).await {
            Ok(Some(reply)) => Some(ServerEnvelope::reply(request_id, reply)),
            Ok(None) => None,
            Err(e) => match e.code() {
                Some(code) => {
                    warn!(
                        peer_id = %self.peer_id,
                        request = name,
                        code = %code,
                        error = %e,
                        "Request failed"
                    );
                    Some(ServerEnvelope::reply(
                        request_id,
                        ServerMessage::Error {
                            code,
                            message: e.to_string(),
                        },
                    ))
                }
                None => {
                    debug!(peer_id = %self.peer_id, request = name, "Ignoring request for closed session");
                    None
                }
            },
        }
    }

    fn joined_room(&self) -> Result<RoomId, Error> {
        match &*self.membership.lock() {
            Membership::Joined(room_id) => Ok(room_id.clone()),
            Membership::NotJoined => Err(Error::precondition("join a room first")),
            Membership::Left => Err(Error::SessionClosed),
        }
    }

    async fn dispatch(
        &self,
        message: ClientMessage,
        sender: &Arc<dyn MessageSender>,
    ) -> Result<Option<ServerMessage>, Error> {
        let directory = &self.directory;
        let peer_id = &self.peer_id;
        let reply = match message {
            ClientMessage::JoinRoom { room_id } => {
                match &*self.membership.lock() {
                    Membership::NotJoined => {}
                    Membership::Joined(_) => {
                        return Err(Error::precondition("already joined a room"));
                    }
                    Membership::Left => return Err(Error::SessionClosed),
                }
                directory
                    .join(room_id.clone(), peer_id.clone(), Arc::clone(sender))
                    .await?;
                *self.membership.lock() = Membership::Joined(room_id.clone());
                if self.disconnected.is_cancelled() {
                    // The reader saw the disconnect before the room was recorded
                    self.disconnect().await;
                    return Err(Error::SessionClosed);
                }
                ServerMessage::Joined {
                    peer_id: peer_id.clone(),
                    room_id,
                }
            }
            ClientMessage::LeaveRoom => {
                let room_id = self.membership.lock().leave();
                if let Some(room_id) = room_id {
                    directory.leave(&room_id, peer_id).await;
                }
                return Ok(None);
            }
            ClientMessage::GetRouterCapabilities => {
                let room_id = self.joined_room()?;
                ServerMessage::RouterCapabilities {
                    rtp_capabilities: directory.router_capabilities(&room_id, peer_id).await?,
                }
            }
            ClientMessage::CreateTransport { direction } => {
                let room_id = self.joined_room()?;
                let descriptor = directory
                    .create_transport(&room_id, peer_id, direction)
                    .await?;
                ServerMessage::transport_created(direction, descriptor)
            }
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room_id = self.joined_room()?;
                directory
                    .connect_transport(&room_id, peer_id, &transport_id, dtls_parameters)
                    .await?;
                ServerMessage::TransportConnected { transport_id }
            }
            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let room_id = self.joined_room()?;
                let producer_id = directory
                    .produce(&room_id, peer_id, &transport_id, kind, rtp_parameters)
                    .await?;
                ServerMessage::Produced { producer_id, kind }
            }
            ClientMessage::GetProducers => {
                let room_id = self.joined_room()?;
                ServerMessage::Producers {
                    producers: directory.get_producers(&room_id, peer_id).await?,
                }
            }
            ClientMessage::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let room_id = self.joined_room()?;
                let descriptor = directory
                    .consume(&room_id, peer_id, &producer_id, &rtp_capabilities)
                    .await?;
                ServerMessage::Consumed(descriptor)
            }
        };
        Ok(Some(reply))
    }
}
