//! Client session orchestrator
//!
//! Drives one peer through the negotiation chain:
//! join → router capabilities → device → send transport → receive transport
//! → (with consent) produce → get-producers → consume.
//!
//! Requests are answered in order, matched by `requestId`. Pushes that arrive
//! while a request is outstanding are buffered and handled afterwards, so a
//! producer announced both by a push and by the `producers` snapshot is
//! consumed once.

use crate::capture::{LocalTrack, MediaCapture, MediaOptions};
use crate::channel::ClientChannel;
use crate::device::{ClientEngine, RemoteTrack};
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use sfumeet_proto::{
    ClientEnvelope, ClientMessage, ErrorCode, MediaKind, PeerId, ProducerId, ProducerInfo,
    RoomId, RtpCapabilities, ServerEnvelope, ServerMessage, TransportDirection, TransportId,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A remote producer received by this session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub peer_id: PeerId,
    pub track: RemoteTrack,
}

#[derive(Debug, Clone)]
struct LocalProducer {
    id: ProducerId,
    track: LocalTrack,
}

pub struct ClientSession {
    channel: Box<dyn ClientChannel>,
    engine: Arc<dyn ClientEngine>,
    capture: Arc<dyn MediaCapture>,
    events: mpsc::UnboundedSender<ClientEvent>,

    next_request_id: u64,
    pending: VecDeque<ServerEnvelope>,

    peer_id: Option<PeerId>,
    room_id: Option<RoomId>,
    capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    local_tracks: Vec<LocalTrack>,
    producers: HashMap<MediaKind, LocalProducer>,
    remote: HashMap<ProducerId, RemoteMedia>,
    left: bool,
}

impl ClientSession {
    /// Create a session and the receiver of its UI events
    pub fn new(
        channel: impl ClientChannel + 'static,
        engine: Arc<dyn ClientEngine>,
        capture: Arc<dyn MediaCapture>,
    ) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let session = Self {
            channel: Box::new(channel),
            engine,
            capture,
            events,
            next_request_id: 0,
            pending: VecDeque::new(),
            peer_id: None,
            room_id: None,
            capabilities: None,
            send_transport: None,
            recv_transport: None,
            local_tracks: Vec::new(),
            producers: HashMap::new(),
            remote: HashMap::new(),
            left: false,
        };
        (session, receiver)
    }

    /// Peer id assigned by the server on join
    #[must_use]
    pub const fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    /// Device capability set, once loaded
    #[must_use]
    pub const fn device_capabilities(&self) -> Option<&RtpCapabilities> {
        self.capabilities.as_ref()
    }

    #[must_use]
    pub fn local_producer(&self, kind: MediaKind) -> Option<&ProducerId> {
        self.producers.get(&kind).map(|p| &p.id)
    }

    #[must_use]
    pub fn remote_media(&self, producer_id: &ProducerId) -> Option<&RemoteMedia> {
        self.remote.get(producer_id)
    }

    /// Producer ids of every received remote stream, sorted
    #[must_use]
    pub fn remote_producers(&self) -> Vec<ProducerId> {
        let mut ids: Vec<_> = self.remote.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub const fn has_left(&self) -> bool {
        self.left
    }

    /// Join `room_id` and negotiate everything needed to send and receive.
    ///
    /// Local media is captured and produced only for the kinds in `consent`.
    /// Failing to send or receive an individual stream is reported as a
    /// banner; failing any earlier step aborts the join.
    pub async fn join(&mut self, room_id: RoomId, consent: MediaOptions) -> Result<()> {
        if self.left {
            return Err(ClientError::PreconditionNotMet(
                "session already left".to_string(),
            ));
        }
        if self.room_id.is_some() {
            return Err(ClientError::PreconditionNotMet(
                "already joined a room".to_string(),
            ));
        }

        match self.negotiate(room_id, consent).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Joining the call failed");
                self.banner(format!("Could not join the call: {e}"));
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self, room_id: RoomId, consent: MediaOptions) -> Result<()> {
        let request = ClientMessage::JoinRoom {
            room_id: room_id.clone(),
        };
        let (peer_id, room_id) = match self.request(request).await? {
            ServerMessage::Joined { peer_id, room_id } => (peer_id, room_id),
            other => return Err(unexpected("join-room", &other)),
        };
        info!(room_id = %room_id, peer_id = %peer_id, "Joined room");
        self.peer_id = Some(peer_id.clone());
        self.room_id = Some(room_id.clone());
        self.emit(ClientEvent::Joined { room_id, peer_id });

        let router = match self.request(ClientMessage::GetRouterCapabilities).await? {
            ServerMessage::RouterCapabilities { rtp_capabilities } => rtp_capabilities,
            other => return Err(unexpected("get-router-capabilities", &other)),
        };
        let capabilities = self.engine.load(&router)?;
        debug!(codecs = capabilities.codecs.len(), "Device loaded");
        self.capabilities = Some(capabilities);

        self.open_transport(TransportDirection::Send).await?;
        self.open_transport(TransportDirection::Recv).await?;

        if !consent.is_empty() {
            self.publish(consent).await?;
        }

        self.sync_producers().await?;
        self.process_pending().await;
        Ok(())
    }

    /// Create a server transport, build its local half and relay the
    /// connection parameters back
    async fn open_transport(&mut self, direction: TransportDirection) -> Result<()> {
        let reply = self
            .request(ClientMessage::CreateTransport { direction })
            .await?;
        let descriptor = match (direction, reply) {
            (TransportDirection::Send, ServerMessage::TransportCreatedSend(d))
            | (TransportDirection::Recv, ServerMessage::TransportCreatedRecv(d)) => d,
            (_, other) => return Err(unexpected("create-transport", &other)),
        };

        let dtls_parameters = self.engine.create_transport(direction, &descriptor).await?;
        let transport_id = descriptor.id;
        match direction {
            TransportDirection::Send => self.send_transport = Some(transport_id.clone()),
            TransportDirection::Recv => self.recv_transport = Some(transport_id.clone()),
        }

        let request = ClientMessage::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters,
        };
        match self.request(request).await? {
            ServerMessage::TransportConnected { .. } => {
                debug!(transport_id = %transport_id, direction = %direction, "Transport connected");
                Ok(())
            }
            other => Err(unexpected("connect-transport", &other)),
        }
    }

    /// Capture and send the kinds in `consent`, replacing what is already
    /// being sent for those kinds. Returns the number of tracks now sent.
    pub async fn publish(&mut self, consent: MediaOptions) -> Result<usize> {
        if self.left || self.send_transport.is_none() {
            return Err(ClientError::PreconditionNotMet(
                "send transport not ready".to_string(),
            ));
        }

        let tracks = match self.capture.acquire(consent).await {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!(error = %e, "Local media capture failed");
                self.banner(format!("Could not access camera or microphone: {e}"));
                return Ok(0);
            }
        };
        self.local_tracks.extend(tracks.iter().cloned());

        let mut ready = Vec::new();
        for track in tracks {
            match self.produce_track(&track).await {
                Ok(()) => ready.push(track),
                Err(e) => {
                    warn!(track = %track, error = %e, "Failed to send local track");
                    self.banner(format!("Could not send {}: {e}", track.kind));
                    self.release_track(&track);
                }
            }
        }

        let count = ready.len();
        if count > 0 {
            self.emit(ClientEvent::LocalMediaReady { tracks: ready });
        }
        Ok(count)
    }

    async fn produce_track(&mut self, track: &LocalTrack) -> Result<()> {
        let transport_id = self
            .send_transport
            .clone()
            .ok_or_else(|| ClientError::PreconditionNotMet("send transport not ready".to_string()))?;

        if let Some(old) = self.producers.remove(&track.kind) {
            debug!(producer_id = %old.id, kind = %track.kind, "Replacing local producer");
            self.engine.close_producer(&old.track);
            self.release_track(&old.track);
        }

        let rtp_parameters = self.engine.produce(&transport_id, track).await?;
        let request = ClientMessage::Produce {
            transport_id,
            kind: track.kind,
            rtp_parameters,
        };
        match self.request(request).await {
            Ok(ServerMessage::Produced { producer_id, kind }) => {
                info!(producer_id = %producer_id, kind = %kind, "Producing");
                self.producers.insert(
                    kind,
                    LocalProducer {
                        id: producer_id,
                        track: track.clone(),
                    },
                );
                Ok(())
            }
            Ok(other) => {
                self.engine.close_producer(track);
                Err(unexpected("produce", &other))
            }
            Err(e) => {
                self.engine.close_producer(track);
                Err(e)
            }
        }
    }

    async fn sync_producers(&mut self) -> Result<()> {
        let producers = match self.request(ClientMessage::GetProducers).await? {
            ServerMessage::Producers { producers } => producers,
            other => return Err(unexpected("get-producers", &other)),
        };
        debug!(count = producers.len(), "Existing producers");
        for info in producers {
            self.consume_remote(info).await;
        }
        Ok(())
    }

    /// Receive `info` unless it is ours or already received
    async fn consume_remote(&mut self, info: ProducerInfo) {
        if self.peer_id.as_ref() == Some(&info.peer_id) || self.remote.contains_key(&info.producer_id)
        {
            return;
        }

        match self.consume_producer(&info).await {
            Ok(track) => {
                info!(
                    producer_id = %info.producer_id,
                    peer_id = %info.peer_id,
                    kind = %info.kind,
                    "Receiving remote media"
                );
                self.remote.insert(
                    info.producer_id.clone(),
                    RemoteMedia {
                        peer_id: info.peer_id.clone(),
                        track,
                    },
                );
                self.emit(ClientEvent::RemoteMediaAdded {
                    producer_id: info.producer_id,
                    peer_id: info.peer_id,
                    kind: info.kind,
                });
            }
            Err(e) if e.server_code() == Some(ErrorCode::ProducerNotFound) => {
                debug!(producer_id = %info.producer_id, "Producer closed before it was consumed");
            }
            Err(e) => {
                warn!(producer_id = %info.producer_id, error = %e, "Failed to consume");
                self.banner(format!(
                    "Could not receive {} from {}: {e}",
                    info.kind, info.peer_id
                ));
            }
        }
    }

    async fn consume_producer(&mut self, info: &ProducerInfo) -> Result<RemoteTrack> {
        let (Some(transport_id), Some(rtp_capabilities)) =
            (self.recv_transport.clone(), self.capabilities.clone())
        else {
            return Err(ClientError::PreconditionNotMet(
                "receive transport not ready".to_string(),
            ));
        };

        let request = ClientMessage::Consume {
            producer_id: info.producer_id.clone(),
            rtp_capabilities,
        };
        let descriptor = match self.request(request).await? {
            ServerMessage::Consumed(descriptor) => descriptor,
            other => return Err(unexpected("consume", &other)),
        };
        self.engine.consume(&transport_id, &descriptor).await
    }

    /// Handle the next server push. Returns false once the channel is closed
    /// or the session has left.
    pub async fn handle_next(&mut self) -> Result<bool> {
        if self.left {
            return Ok(false);
        }
        let envelope = match self.pending.pop_front() {
            Some(envelope) => envelope,
            None => match self.channel.recv().await {
                Some(envelope) => envelope?,
                None => {
                    info!("Signaling channel closed");
                    return Ok(false);
                }
            },
        };
        self.handle_push(envelope).await;
        Ok(true)
    }

    /// Handle every push buffered during earlier requests
    pub async fn process_pending(&mut self) {
        while let Some(envelope) = self.pending.pop_front() {
            self.handle_push(envelope).await;
        }
    }

    async fn handle_push(&mut self, envelope: ServerEnvelope) {
        let ServerEnvelope {
            request_id,
            message,
        } = envelope;
        match message {
            ServerMessage::NewProducer(info) => self.consume_remote(info).await,
            ServerMessage::ProducerClosed { producer_id } => self.drop_remote(&producer_id),
            ServerMessage::PeerDisconnected { peer_id } => {
                info!(peer_id = %peer_id, "Peer left");
                let gone: Vec<ProducerId> = self
                    .remote
                    .iter()
                    .filter(|(_, media)| media.peer_id == peer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for producer_id in gone {
                    self.drop_remote(&producer_id);
                }
            }
            ServerMessage::Error { code, message } => {
                warn!(code = %code, message = %message, "Server reported an error");
                self.banner(format!("Server error ({code}): {message}"));
            }
            other => {
                debug!(message = other.name(), ?request_id, "Ignoring unsolicited message");
            }
        }
    }

    fn drop_remote(&mut self, producer_id: &ProducerId) {
        if let Some(media) = self.remote.remove(producer_id) {
            self.engine.close_consumer(&media.track.consumer_id);
            self.emit(ClientEvent::RemoteMediaRemoved {
                producer_id: producer_id.clone(),
            });
        }
    }

    /// Close every consumer, producer and transport, stop local capture and
    /// tell the server. Safe to call more than once.
    pub async fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        self.close_local();

        if self.room_id.take().is_some() {
            let leave = ClientEnvelope::new(ClientMessage::LeaveRoom);
            if let Err(e) = self.channel.send(leave).await {
                debug!(error = %e, "Could not send leave-room");
            }
        }
        self.channel.close().await;
        info!("Left the call");
        self.emit(ClientEvent::Left);
    }

    fn close_local(&mut self) {
        for (_, media) in self.remote.drain() {
            self.engine.close_consumer(&media.track.consumer_id);
        }
        for (_, producer) in self.producers.drain() {
            self.engine.close_producer(&producer.track);
        }
        for transport_id in [self.send_transport.take(), self.recv_transport.take()]
            .into_iter()
            .flatten()
        {
            self.engine.close_transport(&transport_id);
        }
        for track in self.local_tracks.drain(..) {
            self.capture.release(&track);
        }
        self.pending.clear();
    }

    fn release_track(&mut self, track: &LocalTrack) {
        self.capture.release(track);
        self.local_tracks.retain(|t| t != track);
    }

    /// Send a request and wait for the reply carrying its id
    async fn request(&mut self, message: ClientMessage) -> Result<ServerMessage> {
        let request = message.name();
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.channel
            .send(ClientEnvelope::request(request_id, message))
            .await?;

        loop {
            let envelope = match self.channel.recv().await {
                Some(envelope) => envelope?,
                None => return Err(ClientError::ChannelClosed),
            };
            if envelope.request_id != Some(request_id) {
                self.pending.push_back(envelope);
                continue;
            }
            return match envelope.message {
                ServerMessage::Error { code, message } => Err(ClientError::Server {
                    request,
                    code,
                    message,
                }),
                reply => Ok(reply),
            };
        }
    }

    fn banner(&self, message: String) {
        self.emit(ClientEvent::Banner { message });
    }

    fn emit(&self, event: ClientEvent) {
        // The UI may have gone away already
        let _ = self.events.send(event);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if !self.left {
            debug!("Client session dropped without leaving");
            self.close_local();
        }
    }
}

fn unexpected(request: &'static str, reply: &ServerMessage) -> ClientError {
    ClientError::UnexpectedReply {
        request,
        reply: reply.name(),
    }
}
