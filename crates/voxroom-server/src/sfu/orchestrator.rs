//! SFU Orchestrator
//!
//! Owns the per-room routers and per-peer media records and drives the media
//! engine. Locks are never nested across peers: every operation takes its own
//! peer record, copies what it needs, releases it, and only then touches room
//! indexes or other peers. Engine calls never run under the router map lock;
//! each room gets its own slot that the first joiner fills.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use voxroom_media::{ConsumerInfo, MediaEngine, RouterInfo};
use voxroom_protocol::{
    ConsumerId, DtlsParameters, MediaKind, PeerId, ProducerId, ProducerInfo, RoomId,
    RtpCapabilities, RtpParameters, SfuRequest, SfuResponse, SfuServerMessage, TransportDirection,
    TransportId, TransportParams,
};

use crate::error::SfuError;
use crate::rooms::{MembershipObserver, RegistryError, RoomRegistry};
use crate::ws::connections::ConnectionManager;

/// Announces departures on the SFU socket. Joins are silent: newcomers learn
/// about media through `getProducers` and `newProducer`.
struct SfuNotifier {
    connections: Arc<ConnectionManager>,
}

#[async_trait]
impl MembershipObserver for SfuNotifier {
    async fn peer_joined(&self, room_id: &RoomId, peer_id: PeerId, existing: &[PeerId]) {
        tracing::debug!(
            "SFU peer {} joined room {} with {} others",
            peer_id,
            room_id,
            existing.len()
        );
    }

    async fn peer_left(&self, _room_id: &RoomId, peer_id: PeerId, remaining: &[PeerId]) {
        self.connections
            .send_to_peers(remaining, &SfuServerMessage::PeerLeft { peer_id })
            .await;
    }
}

struct ProducerEntry {
    peer_id: PeerId,
    kind: MediaKind,
    /// Consumers sourced from this producer, with their owners
    consumers: Vec<(PeerId, ConsumerId)>,
}

struct RoomMedia {
    router: RouterInfo,
    producers: Mutex<HashMap<ProducerId, ProducerEntry>>,
}

/// A room's router, created once by whichever join gets there first
type RouterSlot = Arc<OnceCell<Arc<RoomMedia>>>;

#[derive(Default)]
struct PeerMedia {
    room_id: Option<RoomId>,
    /// Last receive capabilities the peer declared
    rtp_capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    producers: HashMap<ProducerId, MediaKind>,
    consumers: HashMap<ConsumerId, ProducerId>,
}

/// Media objects unlinked from a peer record, waiting to be closed
#[derive(Default)]
struct Detached {
    producers: Vec<ProducerId>,
    consumers: Vec<(ConsumerId, ProducerId)>,
    transports: Vec<TransportId>,
}

impl PeerMedia {
    fn transport(&self, direction: TransportDirection) -> Option<&TransportId> {
        match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        }
    }

    fn set_transport(&mut self, direction: TransportDirection, id: TransportId) {
        match direction {
            TransportDirection::Send => self.send_transport = Some(id),
            TransportDirection::Recv => self.recv_transport = Some(id),
        }
    }

    /// Unlink one transport and whatever lives on it
    fn detach_transport(&mut self, direction: TransportDirection) -> Detached {
        let mut detached = Detached::default();
        match direction {
            TransportDirection::Send => {
                detached.transports.extend(self.send_transport.take());
                detached.producers = self.producers.drain().map(|(id, _)| id).collect();
            }
            TransportDirection::Recv => {
                detached.transports.extend(self.recv_transport.take());
                detached.consumers = self.consumers.drain().collect();
            }
        }
        detached
    }

    fn detach_all(&mut self) -> Detached {
        let mut detached = self.detach_transport(TransportDirection::Send);
        let recv = self.detach_transport(TransportDirection::Recv);
        detached.consumers = recv.consumers;
        detached.transports.extend(recv.transports);
        detached
    }
}

pub struct SfuOrchestrator {
    engine: Arc<dyn MediaEngine>,
    connections: Arc<ConnectionManager>,
    rooms: RoomRegistry,
    routers: RwLock<HashMap<RoomId, RouterSlot>>,
    peers: RwLock<HashMap<PeerId, Arc<Mutex<PeerMedia>>>>,
}

impl SfuOrchestrator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        connections: Arc<ConnectionManager>,
        max_peers_per_room: usize,
    ) -> Self {
        let notifier = Arc::new(SfuNotifier {
            connections: connections.clone(),
        });

        Self {
            engine,
            connections,
            rooms: RoomRegistry::new(notifier, max_peers_per_room),
            routers: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_peer(&self, peer_id: PeerId) {
        self.peers
            .write()
            .await
            .insert(peer_id, Arc::new(Mutex::new(PeerMedia::default())));
    }

    pub async fn dispatch(
        &self,
        peer_id: PeerId,
        request: SfuRequest,
    ) -> Result<SfuResponse, SfuError> {
        match request {
            SfuRequest::JoinRoom { room_id } => self
                .join_room(peer_id, &room_id)
                .await
                .map(|rtp_capabilities| SfuResponse::Joined { rtp_capabilities }),
            SfuRequest::CreateTransport { direction } => self
                .create_transport(peer_id, direction)
                .await
                .map(SfuResponse::TransportCreated),
            SfuRequest::ConnectTransport {
                direction,
                dtls_parameters,
            } => self
                .connect_transport(peer_id, direction, dtls_parameters)
                .await
                .map(|_| SfuResponse::TransportConnected),
            SfuRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self
                .produce(peer_id, transport_id, kind, rtp_parameters)
                .await
                .map(|producer_id| SfuResponse::Produced { producer_id }),
            SfuRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => self
                .consume(peer_id, producer_id, rtp_capabilities)
                .await
                .map(|consumer| SfuResponse::Consumed {
                    consumer_id: consumer.id,
                    producer_id: consumer.producer_id,
                    kind: consumer.kind,
                    rtp_parameters: consumer.rtp_parameters,
                }),
            SfuRequest::GetProducers => self
                .producers_for(peer_id)
                .await
                .map(|producers| SfuResponse::Producers { producers }),
            SfuRequest::LeaveRoom => self.leave_room(peer_id).await.map(|_| SfuResponse::Left),
        }
    }

    /// Join the registry, then make sure the room has a router
    pub async fn join_room(
        &self,
        peer_id: PeerId,
        room_name: &str,
    ) -> Result<RtpCapabilities, SfuError> {
        let peer = self.peer(peer_id).await?;
        let target = RoomId::sanitize(room_name).map_err(RegistryError::from)?;

        let current = peer.lock().await.room_id.clone();
        if current.as_ref() == Some(&target) {
            let media = self.room_media(&target).await?;
            return Ok(media.router.rtp_capabilities.clone());
        }
        if current.is_some() {
            self.teardown(peer_id, &peer).await;
        }

        let outcome = self.rooms.join(peer_id, room_name).await?;

        let media = match self.ensure_router(&outcome.room_id).await {
            Ok(media) => media,
            Err(e) => {
                tracing::error!("Failed to create router for {}: {}", outcome.room_id, e);
                if let Some(left) = self.rooms.leave(peer_id).await {
                    if left.remaining.is_empty() {
                        self.release_router_if_empty(&left.room_id).await;
                    }
                }
                return Err(e);
            }
        };

        peer.lock().await.room_id = Some(outcome.room_id.clone());

        tracing::info!(
            "Peer {} joined SFU room {} (router {})",
            peer_id,
            outcome.room_id,
            media.router.id
        );

        Ok(media.router.rtp_capabilities.clone())
    }

    /// Create the peer's transport for `direction`, replacing any earlier one
    pub async fn create_transport(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
    ) -> Result<TransportParams, SfuError> {
        let peer = self.peer(peer_id).await?;
        let (room_id, previous) = {
            let mut record = peer.lock().await;
            let room_id = record.room_id.clone().ok_or(SfuError::NotInRoom)?;
            (room_id, record.detach_transport(direction))
        };

        let media = self.room_media(&room_id).await?;

        if !previous.transports.is_empty() {
            tracing::debug!("Replacing {} transport of peer {}", direction, peer_id);
        }
        self.close_detached(Some(&media), previous).await;

        let params = self
            .engine
            .create_transport(&media.router.id, direction)
            .await?;

        let mut record = peer.lock().await;
        if record.room_id.as_ref() != Some(&room_id) {
            drop(record);
            self.engine.close_transport(&params.id).await;
            return Err(SfuError::PeerGone);
        }
        record.set_transport(direction, params.id.clone());

        tracing::debug!(
            "Created {} transport {} for peer {}",
            direction,
            params.id,
            peer_id
        );

        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let peer = self.peer(peer_id).await?;
        let transport_id = {
            let record = peer.lock().await;
            if record.room_id.is_none() {
                return Err(SfuError::NotInRoom);
            }
            record
                .transport(direction)
                .cloned()
                .ok_or(SfuError::NoTransport(direction))?
        };

        self.engine
            .connect_transport(&transport_id, dtls_parameters)
            .await?;

        tracing::debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Start a producer on the peer's send transport and tell everyone else in the room
    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let peer = self.peer(peer_id).await?;
        let room_id = {
            let record = peer.lock().await;
            let room_id = record.room_id.clone().ok_or(SfuError::NotInRoom)?;
            match record.send_transport.as_ref() {
                Some(current) if *current == transport_id => {}
                Some(_) => return Err(SfuError::ForeignTransport(transport_id)),
                None => return Err(SfuError::NoTransport(TransportDirection::Send)),
            }
            room_id
        };

        let media = self.room_media(&room_id).await?;
        let producer_id = self
            .engine
            .produce(&transport_id, kind, rtp_parameters)
            .await?;

        peer.lock().await.producers.insert(producer_id.clone(), kind);
        media.producers.lock().await.insert(
            producer_id.clone(),
            ProducerEntry {
                peer_id,
                kind,
                consumers: Vec::new(),
            },
        );

        let others: Vec<PeerId> = self
            .rooms
            .members_of(&room_id)
            .await
            .into_iter()
            .filter(|p| *p != peer_id)
            .collect();

        self.connections
            .send_to_peers(
                &others,
                &SfuServerMessage::NewProducer {
                    producer_id: producer_id.clone(),
                    producer_peer_id: peer_id,
                    kind,
                },
            )
            .await;

        tracing::info!(
            "Peer {} producing {} as {} in room {} ({} notified)",
            peer_id,
            kind,
            producer_id,
            room_id,
            others.len()
        );

        Ok(producer_id)
    }

    /// Consume a producer on the peer's receive transport.
    ///
    /// The router decides compatibility against the capabilities declared in
    /// this request; a mismatch creates nothing.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerInfo, SfuError> {
        let peer = self.peer(peer_id).await?;
        let (room_id, transport_id) = {
            let mut record = peer.lock().await;
            let room_id = record.room_id.clone().ok_or(SfuError::NotInRoom)?;
            let transport_id = record
                .recv_transport
                .clone()
                .ok_or(SfuError::NoTransport(TransportDirection::Recv))?;
            record.rtp_capabilities = Some(rtp_capabilities.clone());
            (room_id, transport_id)
        };

        let media = self.room_media(&room_id).await?;
        if !media.producers.lock().await.contains_key(&producer_id) {
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        if !self
            .engine
            .can_consume(&media.router.id, &producer_id, &rtp_capabilities)
            .await?
        {
            tracing::warn!(
                "Peer {} cannot receive producer {}: no compatible codec",
                peer_id,
                producer_id
            );
            return Err(SfuError::CapabilityMismatch(producer_id));
        }

        let consumer = self
            .engine
            .consume(&transport_id, &producer_id, &rtp_capabilities)
            .await?;

        peer.lock()
            .await
            .consumers
            .insert(consumer.id.clone(), producer_id.clone());

        let indexed = match media.producers.lock().await.get_mut(&producer_id) {
            Some(entry) => {
                entry.consumers.push((peer_id, consumer.id.clone()));
                true
            }
            None => false,
        };

        if !indexed {
            // Producer closed while the consumer was being created
            peer.lock().await.consumers.remove(&consumer.id);
            self.engine.close_consumer(&consumer.id).await;
            return Err(SfuError::ProducerNotFound(producer_id));
        }

        tracing::debug!(
            "Peer {} consuming {} via {}",
            peer_id,
            producer_id,
            consumer.id
        );

        Ok(consumer)
    }

    /// Producers of the other members, for a late joiner to consume
    pub async fn producers_for(&self, peer_id: PeerId) -> Result<Vec<ProducerInfo>, SfuError> {
        let peer = self.peer(peer_id).await?;
        let room_id = peer
            .lock()
            .await
            .room_id
            .clone()
            .ok_or(SfuError::NotInRoom)?;

        let media = self.room_media(&room_id).await?;
        let producers = media.producers.lock().await;

        let mut list: Vec<ProducerInfo> = producers
            .iter()
            .filter(|(_, entry)| entry.peer_id != peer_id)
            .map(|(id, entry)| ProducerInfo {
                producer_id: id.clone(),
                producer_peer_id: entry.peer_id,
                kind: entry.kind,
            })
            .collect();
        list.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));

        Ok(list)
    }

    /// Same teardown as a disconnect, but the peer stays registered
    pub async fn leave_room(&self, peer_id: PeerId) -> Result<(), SfuError> {
        let peer = self.peer(peer_id).await?;
        self.teardown(peer_id, &peer).await;
        Ok(())
    }

    /// Forget the peer and release everything it owned
    pub async fn disconnect(&self, peer_id: PeerId) {
        let peer = self.peers.write().await.remove(&peer_id);
        match peer {
            Some(peer) => self.teardown(peer_id, &peer).await,
            None => tracing::debug!("SFU peer {} was not registered", peer_id),
        }
    }

    pub async fn shutdown(&self) {
        self.rooms.clear().await;
        self.peers.write().await.clear();

        let slots: Vec<(RoomId, RouterSlot)> = self.routers.write().await.drain().collect();
        for (room_id, slot) in slots {
            if let Some(media) = slot.get() {
                self.engine.close_router(&media.router.id).await;
                tracing::debug!("Closed router for room {}", room_id);
            }
        }
    }

    pub async fn room_of(&self, peer_id: PeerId) -> Option<RoomId> {
        self.rooms.room_of(peer_id).await
    }

    pub async fn members_of(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms.members_of(room_id).await
    }

    pub async fn router_count(&self) -> usize {
        self.routers
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Capabilities the peer declared with its last consume
    pub async fn declared_capabilities(&self, peer_id: PeerId) -> Option<RtpCapabilities> {
        let peer = self.peers.read().await.get(&peer_id).cloned()?;
        let record = peer.lock().await;
        record.rtp_capabilities.clone()
    }

    async fn peer(&self, peer_id: PeerId) -> Result<Arc<Mutex<PeerMedia>>, SfuError> {
        self.peers
            .read()
            .await
            .get(&peer_id)
            .cloned()
            .ok_or(SfuError::PeerGone)
    }

    async fn room_media(&self, room_id: &RoomId) -> Result<Arc<RoomMedia>, SfuError> {
        let slot = self.routers.read().await.get(room_id).cloned();
        slot.and_then(|slot| slot.get().cloned())
            .ok_or(SfuError::NotInRoom)
    }

    async fn ensure_router(&self, room_id: &RoomId) -> Result<Arc<RoomMedia>, SfuError> {
        let slot = self
            .routers
            .write()
            .await
            .entry(room_id.clone())
            .or_default()
            .clone();

        let media = slot
            .get_or_try_init(|| async {
                let router = self.engine.create_router().await?;
                tracing::info!("Created router {} for room {}", router.id, room_id);
                Ok::<_, SfuError>(Arc::new(RoomMedia {
                    router,
                    producers: Mutex::new(HashMap::new()),
                }))
            })
            .await?;

        Ok(media.clone())
    }

    /// Close the room's router unless someone joined in the meantime
    async fn release_router_if_empty(&self, room_id: &RoomId) {
        let slot = {
            let mut routers = self.routers.write().await;
            if !self.rooms.members_of(room_id).await.is_empty() {
                return;
            }
            routers.remove(room_id)
        };

        if let Some(media) = slot.as_deref().and_then(OnceCell::get) {
            self.engine.close_router(&media.router.id).await;
            tracing::info!("Released router {} of room {}", media.router.id, room_id);
        }
    }

    /// Producers, then consumers, then transports, then registry membership
    async fn teardown(&self, peer_id: PeerId, peer: &Mutex<PeerMedia>) {
        let (room_id, detached) = {
            let mut record = peer.lock().await;
            record.rtp_capabilities = None;
            (record.room_id.take(), record.detach_all())
        };

        // A join interrupted before it was recorded still left a registry entry
        let room_id = match room_id {
            Some(room_id) => Some(room_id),
            None => self.rooms.room_of(peer_id).await,
        };

        let media = match &room_id {
            Some(room_id) => self.room_media(room_id).await.ok(),
            None => None,
        };
        self.close_detached(media.as_deref(), detached).await;

        if let Some(outcome) = self.rooms.leave(peer_id).await {
            tracing::info!(
                "SFU peer {} left room {} ({} remaining)",
                peer_id,
                outcome.room_id,
                outcome.remaining.len()
            );
            if outcome.remaining.is_empty() {
                self.release_router_if_empty(&outcome.room_id).await;
            }
        }
    }

    async fn close_detached(&self, media: Option<&RoomMedia>, detached: Detached) {
        for producer_id in &detached.producers {
            match media {
                Some(media) => self.close_producer(media, producer_id).await,
                None => self.engine.close_producer(producer_id).await,
            }
        }

        for (consumer_id, producer_id) in &detached.consumers {
            if let Some(media) = media {
                if let Some(entry) = media.producers.lock().await.get_mut(producer_id) {
                    entry.consumers.retain(|(_, id)| id != consumer_id);
                }
            }
            self.engine.close_consumer(consumer_id).await;
        }

        for transport_id in &detached.transports {
            self.engine.close_transport(transport_id).await;
        }
    }

    /// Close a producer and every consumer sourced from it, telling each owner
    async fn close_producer(&self, media: &RoomMedia, producer_id: &ProducerId) {
        let entry = media.producers.lock().await.remove(producer_id);
        self.engine.close_producer(producer_id).await;

        let Some(entry) = entry else {
            return;
        };

        for (owner, consumer_id) in entry.consumers {
            let peer = self.peers.read().await.get(&owner).cloned();
            if let Some(peer) = peer {
                peer.lock().await.consumers.remove(&consumer_id);
            }
            self.engine.close_consumer(&consumer_id).await;

            self.connections
                .send_to_peer(
                    owner,
                    &SfuServerMessage::ConsumerClosed {
                        consumer_id,
                        producer_id: producer_id.clone(),
                    },
                )
                .await;
        }

        tracing::debug!("Closed producer {} of peer {}", producer_id, entry.peer_id);
    }
}
