//! Multi-peer scenarios against the room directory and the local engine

use async_trait::async_trait;
use serde_json::{json, Value};
use sfumeet_proto::{
    ConsumerDescriptor, ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpParameters, ServerEnvelope, ServerMessage,
    TransportDescriptor, TransportDirection, TransportId,
};
use sfumeet_sfu::engine::EngineResult;
use sfumeet_sfu::{EngineStats, Error, LocalEngine, MediaEngine, RoomDirectory, SessionState, SfuConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};

/// Local engine whose create/produce/consume calls can be held open
struct GatedEngine {
    inner: LocalEngine,
    armed: AtomicBool,
    entered: Notify,
    gate: Semaphore,
    closed_consumers: Mutex<Vec<ConsumerId>>,
}

impl GatedEngine {
    fn new() -> Self {
        Self {
            inner: LocalEngine::default(),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            gate: Semaphore::new(0),
            closed_consumers: Mutex::new(Vec::new()),
        }
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
    }

    async fn pass(&self) {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
        }
    }
}

#[async_trait]
impl MediaEngine for GatedEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &ProducerId, caps: &RtpCapabilities) -> bool {
        self.inner.can_consume(producer_id, caps)
    }

    fn is_alive(&self) -> bool {
        self.inner.is_alive()
    }

    async fn died(&self) {
        self.inner.died().await;
    }

    async fn create_transport(&self, direction: TransportDirection) -> EngineResult<TransportDescriptor> {
        self.pass().await;
        self.inner.create_transport(direction).await
    }

    async fn connect_transport(&self, transport_id: &TransportId, dtls: Value) -> EngineResult<()> {
        self.inner.connect_transport(transport_id, dtls).await
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerId> {
        self.pass().await;
        self.inner.produce(transport_id, kind, rtp_parameters).await
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        caps: &RtpCapabilities,
    ) -> EngineResult<ConsumerDescriptor> {
        self.pass().await;
        self.inner.consume(transport_id, producer_id, caps).await
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        self.inner.close_transport(transport_id).await;
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.inner.close_producer(producer_id).await;
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.closed_consumers.lock().push(consumer_id.clone());
        self.inner.close_consumer(consumer_id).await;
    }
}

struct Peer {
    room: RoomId,
    id: PeerId,
    inbox: mpsc::UnboundedReceiver<ServerEnvelope>,
    send: Option<TransportId>,
}

impl Peer {
    fn pushes(&mut self) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(envelope) = self.inbox.try_recv() {
            assert!(envelope.request_id.is_none());
            out.push(envelope.message);
        }
        out
    }
}

fn setup() -> (Arc<GatedEngine>, Arc<RoomDirectory>) {
    let engine = Arc::new(GatedEngine::new());
    let directory = RoomDirectory::new(engine.clone(), SfuConfig::default());
    (engine, directory)
}

async fn join(directory: &RoomDirectory, room: &str, peer: &str) -> Peer {
    let (tx, inbox) = mpsc::unbounded_channel();
    directory
        .join(RoomId::from(room), PeerId::from(peer), Arc::new(tx))
        .await
        .unwrap();
    Peer {
        room: RoomId::from(room),
        id: PeerId::from(peer),
        inbox,
        send: None,
    }
}

fn dtls() -> Value {
    json!({ "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }] })
}

/// Capabilities, both transports created and connected
async fn negotiate(directory: &RoomDirectory, peer: &mut Peer) {
    directory.router_capabilities(&peer.room, &peer.id).await.unwrap();
    for direction in [TransportDirection::Send, TransportDirection::Recv] {
        let desc = directory
            .create_transport(&peer.room, &peer.id, direction)
            .await
            .unwrap();
        directory
            .connect_transport(&peer.room, &peer.id, &desc.id, dtls())
            .await
            .unwrap();
        if direction == TransportDirection::Send {
            peer.send = Some(desc.id);
        }
    }
}

fn parameters(kind: MediaKind) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecCapability::opus(),
        MediaKind::Video => RtpCodecCapability::vp8(),
    };
    RtpParameters::with_codec(RtpCodecParameters::from_capability(&codec, 96))
}

async fn produce(directory: &RoomDirectory, peer: &Peer, kind: MediaKind) -> ProducerId {
    directory
        .produce(&peer.room, &peer.id, peer.send.as_ref().unwrap(), kind, parameters(kind))
        .await
        .unwrap()
}

async fn state(directory: &RoomDirectory, peer: &Peer) -> SessionState {
    directory
        .room(&peer.room)
        .unwrap()
        .session(&peer.id)
        .await
        .unwrap()
        .state()
}

#[tokio::test]
async fn scenario_a_declined_peer_gets_one_announcement() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    negotiate(&directory, &mut p1).await;
    assert_eq!(state(&directory, &p1).await, SessionState::Negotiating);
    assert!(directory.get_producers(&p1.room, &p1.id).await.unwrap().is_empty());
    assert_eq!(state(&directory, &p1).await, SessionState::Active);

    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p2).await;
    let video = produce(&directory, &p2, MediaKind::Video).await;
    assert_eq!(state(&directory, &p2).await, SessionState::Active);

    let pushes = p1.pushes();
    assert_eq!(pushes.len(), 1);
    match &pushes[0] {
        ServerMessage::NewProducer(info) => {
            assert_eq!(info.producer_id, video);
            assert_eq!(info.kind, MediaKind::Video);
            assert_eq!(info.peer_id, p2.id);
        }
        other => panic!("unexpected push {other:?}"),
    }
    assert!(p2.pushes().is_empty());
    assert_eq!(engine.inner.stats().producers, 1);
}

#[tokio::test]
async fn scenario_b_departure_is_announced_once() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    let v1 = produce(&directory, &p1, MediaKind::Video).await;
    let v2 = produce(&directory, &p2, MediaKind::Video).await;
    let caps = engine.rtp_capabilities();
    directory.consume(&p2.room, &p2.id, &v1, &caps).await.unwrap();
    p2.pushes();

    assert!(directory.leave(&p1.room, &p1.id).await);
    assert!(!directory.leave(&p1.room, &p1.id).await);

    let pushes = p2.pushes();
    let departures: Vec<_> = pushes
        .iter()
        .filter(|m| matches!(m, ServerMessage::PeerDisconnected { peer_id } if *peer_id == p1.id))
        .collect();
    assert_eq!(departures.len(), 1);
    assert_eq!(pushes.len(), 1);

    let mut p3 = join(&directory, "R1", "p3").await;
    negotiate(&directory, &mut p3).await;
    let listed = directory.get_producers(&p3.room, &p3.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].producer_id, v2);

    // p1's producer, and p2's consumer of it, are gone at the engine too
    assert_eq!(
        engine.inner.stats(),
        EngineStats {
            transports: 4,
            producers: 1,
            consumers: 0
        }
    );
}

#[tokio::test]
async fn scenario_c_produce_before_transport() {
    let (_engine, directory) = setup();
    let p1 = join(&directory, "R1", "p1").await;
    let err = directory
        .produce(
            &p1.room,
            &p1.id,
            &TransportId::from("none"),
            MediaKind::Video,
            parameters(MediaKind::Video),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionNotMet(_)));
    assert_eq!(state(&directory, &p1).await, SessionState::Negotiating);
}

#[tokio::test]
async fn transport_before_capabilities_is_rejected() {
    let (engine, directory) = setup();
    let p1 = join(&directory, "R1", "p1").await;
    let err = directory
        .create_transport(&p1.room, &p1.id, TransportDirection::Send)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionNotMet(_)));
    assert_eq!(engine.inner.stats().transports, 0);
}

#[tokio::test]
async fn replacing_the_send_transport_closes_remote_consumers() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    directory.get_producers(&p2.room, &p2.id).await.unwrap();

    let video = produce(&directory, &p1, MediaKind::Video).await;
    let caps = engine.rtp_capabilities();
    let consumer = directory.consume(&p2.room, &p2.id, &video, &caps).await.unwrap();
    p2.pushes();

    directory
        .create_transport(&p1.room, &p1.id, TransportDirection::Send)
        .await
        .unwrap();

    assert_eq!(*engine.closed_consumers.lock(), vec![consumer.consumer_id]);
    assert_eq!(
        p2.pushes(),
        vec![ServerMessage::ProducerClosed { producer_id: video }]
    );
    assert_eq!(directory.stats().await.consumers, 0);
    assert_eq!(engine.inner.stats().consumers, 0);
}

#[tokio::test]
async fn replacing_a_producer_twice_leaves_one() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    directory.get_producers(&p2.room, &p2.id).await.unwrap();

    let first = produce(&directory, &p1, MediaKind::Video).await;
    let caps = engine.rtp_capabilities();
    directory.consume(&p2.room, &p2.id, &first, &caps).await.unwrap();
    let second = produce(&directory, &p1, MediaKind::Video).await;
    let third = produce(&directory, &p1, MediaKind::Video).await;
    assert_ne!(first, second);
    assert_ne!(second, third);

    let stats = directory.stats().await;
    assert_eq!(stats.video_producers, 1);
    assert_eq!(stats.consumers, 0);
    assert_eq!(engine.inner.stats().producers, 1);
    assert_eq!(engine.inner.stats().consumers, 0);

    let listed = directory.get_producers(&p2.room, &p2.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].producer_id, third);

    let pushes = p2.pushes();
    let closed: Vec<&ProducerId> = pushes
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ProducerClosed { producer_id } => Some(producer_id),
            _ => None,
        })
        .collect();
    assert_eq!(closed, vec![&first, &second]);
}

#[tokio::test]
async fn consume_after_owner_left_is_producer_not_found() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    produce(&directory, &p1, MediaKind::Audio).await;

    let snapshot = directory.get_producers(&p2.room, &p2.id).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    directory.leave(&p1.room, &p1.id).await;

    let err = directory
        .consume(&p2.room, &p2.id, &snapshot[0].producer_id, &engine.rtp_capabilities())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProducerNotFound(_)));
    assert_eq!(state(&directory, &p2).await, SessionState::Active);
}

#[tokio::test]
async fn consume_own_or_unsatisfiable_producer_fails() {
    let (_engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    let audio = produce(&directory, &p1, MediaKind::Audio).await;

    let caps = directory.router_capabilities(&p1.room, &p1.id).await.unwrap();
    let own = directory.consume(&p1.room, &p1.id, &audio, &caps).await.unwrap_err();
    assert!(matches!(own, Error::PreconditionNotMet(_)));

    let video_only = RtpCapabilities::new(vec![RtpCodecCapability::vp8()]);
    let mismatch = directory
        .consume(&p2.room, &p2.id, &audio, &video_only)
        .await
        .unwrap_err();
    assert!(matches!(mismatch, Error::CapabilityMismatch { .. }));

    // the session survives and can still consume
    let consumed = directory.consume(&p2.room, &p2.id, &audio, &caps).await.unwrap();
    let again = directory.consume(&p2.room, &p2.id, &audio, &caps).await.unwrap();
    assert_eq!(consumed.consumer_id, again.consumer_id);
    assert_eq!(consumed.kind, MediaKind::Audio);
}

#[tokio::test]
async fn connect_twice_succeeds_without_side_effects() {
    let (engine, directory) = setup();
    let p1 = join(&directory, "R1", "p1").await;
    directory.router_capabilities(&p1.room, &p1.id).await.unwrap();
    let desc = directory
        .create_transport(&p1.room, &p1.id, TransportDirection::Recv)
        .await
        .unwrap();
    for _ in 0..2 {
        directory
            .connect_transport(&p1.room, &p1.id, &desc.id, dtls())
            .await
            .unwrap();
    }
    assert_eq!(engine.inner.stats().transports, 1);
    assert_eq!(state(&directory, &p1).await, SessionState::Negotiating);
}

#[tokio::test]
async fn transport_created_during_leave_is_closed() {
    let (engine, directory) = setup();
    let p1 = join(&directory, "R1", "p1").await;
    directory.router_capabilities(&p1.room, &p1.id).await.unwrap();

    engine.arm();
    let task = {
        let directory = Arc::clone(&directory);
        let (room, id) = (p1.room.clone(), p1.id.clone());
        tokio::spawn(async move {
            directory
                .create_transport(&room, &id, TransportDirection::Send)
                .await
        })
    };
    engine.entered.notified().await;
    assert!(directory.leave(&p1.room, &p1.id).await);
    engine.release();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::SessionClosed)));
    assert_eq!(engine.inner.stats(), EngineStats::default());
}

#[tokio::test]
async fn producer_created_during_leave_is_closed_and_never_announced() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    directory.get_producers(&p2.room, &p2.id).await.unwrap();

    engine.arm();
    let task = {
        let directory = Arc::clone(&directory);
        let (room, id, send) = (p1.room.clone(), p1.id.clone(), p1.send.clone().unwrap());
        tokio::spawn(async move {
            directory
                .produce(&room, &id, &send, MediaKind::Video, parameters(MediaKind::Video))
                .await
        })
    };
    engine.entered.notified().await;
    directory.leave(&p1.room, &p1.id).await;
    engine.release();

    assert!(matches!(task.await.unwrap(), Err(Error::SessionClosed)));
    assert_eq!(engine.inner.stats().producers, 0);
    let pushes = p2.pushes();
    assert!(pushes.iter().all(|m| !matches!(m, ServerMessage::NewProducer(_))));
    assert!(directory.get_producers(&p2.room, &p2.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn consumer_created_during_leave_is_closed() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    let video = produce(&directory, &p1, MediaKind::Video).await;

    engine.arm();
    let task = {
        let directory = Arc::clone(&directory);
        let caps = engine.rtp_capabilities();
        let (room, id) = (p2.room.clone(), p2.id.clone());
        tokio::spawn(async move { directory.consume(&room, &id, &video, &caps).await })
    };
    engine.entered.notified().await;
    directory.leave(&p2.room, &p2.id).await;
    engine.release();

    assert!(matches!(task.await.unwrap(), Err(Error::SessionClosed)));
    assert_eq!(engine.inner.stats().consumers, 0);
}

#[tokio::test]
async fn listed_producers_never_reference_departed_peers() {
    let (engine, directory) = setup();
    let mut peers = Vec::new();
    for i in 0..6 {
        let mut peer = join(&directory, "R1", &format!("p{i}")).await;
        negotiate(&directory, &mut peer).await;
        produce(&directory, &peer, MediaKind::Audio).await;
        if i % 2 == 0 {
            produce(&directory, &peer, MediaKind::Video).await;
        }
        peers.push(peer);
    }

    let mut observer = join(&directory, "R1", "observer").await;
    negotiate(&directory, &mut observer).await;

    for leaving in [1usize, 4, 0, 5] {
        let peer = &peers[leaving];
        directory.leave(&peer.room, &peer.id).await;
        let listed = directory
            .get_producers(&observer.room, &observer.id)
            .await
            .unwrap();
        let room = directory.room(&observer.room).unwrap();
        for info in &listed {
            assert!(room.session(&info.peer_id).await.is_some());
        }
        assert!(listed.iter().all(|info| info.peer_id != peer.id));
    }

    let remaining: Vec<_> = directory
        .get_producers(&observer.room, &observer.id)
        .await
        .unwrap()
        .into_iter()
        .map(|info| info.peer_id)
        .collect();
    assert_eq!(remaining.len(), 3);
    assert_eq!(engine.inner.stats().producers, 3);
}

#[tokio::test]
async fn broadcasts_stay_inside_the_room() {
    let (_engine, directory) = setup();
    let mut a = join(&directory, "R1", "a").await;
    let mut b = join(&directory, "R2", "b").await;
    negotiate(&directory, &mut a).await;
    negotiate(&directory, &mut b).await;
    directory.get_producers(&b.room, &b.id).await.unwrap();

    produce(&directory, &a, MediaKind::Video).await;
    directory.leave(&a.room, &a.id).await;
    assert!(b.pushes().is_empty());
}

#[tokio::test]
async fn everyone_leaving_releases_every_engine_object() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    let mut p2 = join(&directory, "R1", "p2").await;
    negotiate(&directory, &mut p1).await;
    negotiate(&directory, &mut p2).await;
    let a1 = produce(&directory, &p1, MediaKind::Audio).await;
    let v2 = produce(&directory, &p2, MediaKind::Video).await;
    let caps = engine.rtp_capabilities();
    directory.consume(&p2.room, &p2.id, &a1, &caps).await.unwrap();
    directory.consume(&p1.room, &p1.id, &v2, &caps).await.unwrap();

    directory.leave(&p2.room, &p2.id).await;
    directory.leave(&p1.room, &p1.id).await;
    assert_eq!(engine.inner.stats(), EngineStats::default());
    assert_eq!(directory.room_count(), 0);
}

#[tokio::test]
async fn engine_death_fails_new_work_with_engine_fatal() {
    let (engine, directory) = setup();
    let mut p1 = join(&directory, "R1", "p1").await;
    negotiate(&directory, &mut p1).await;

    engine.inner.kill();
    let err = directory
        .produce(
            &p1.room,
            &p1.id,
            p1.send.as_ref().unwrap(),
            MediaKind::Audio,
            parameters(MediaKind::Audio),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EngineFatal(_)));
    assert_eq!(err.code(), Some(sfumeet_proto::ErrorCode::EngineFatal));
}
