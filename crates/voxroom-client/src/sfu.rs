//! SFU session
//!
//! Drives the `/sfu` request protocol for one peer: join a room, open one
//! send and one receive transport, publish audio and consume what other
//! members publish. Responses are correlated by [`RpcClient`]; everything
//! else the server pushes is queued as a notification.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use rand::Rng;
use voxroom_protocol::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, PeerId, ProducerId,
    ProducerInfo, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpEncoding,
    RtpParameters, SfuClientMessage, SfuRequest, SfuResponse, SfuServerMessage,
    TransportDirection, TransportId, TransportParams,
};

use crate::error::ClientError;
use crate::network;
use crate::rpc::RpcClient;

const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

const OPUS_PAYLOAD_TYPE: u8 = 111;

/// A remote producer this session is receiving
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedTrack {
    pub consumer_id: ConsumerId,
    pub producer_peer_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

pub struct SfuSession {
    peer_id: PeerId,
    rpc: Arc<RpcClient>,
    notifications: mpsc::UnboundedReceiver<SfuServerMessage>,
    local_capabilities: RtpCapabilities,
    router_capabilities: Option<RtpCapabilities>,
    send_transport: Option<TransportParams>,
    recv_transport: Option<TransportParams>,
    producers: HashMap<ProducerId, MediaKind>,
    consumers: HashMap<ProducerId, ConsumedTrack>,
    /// Producers we cannot decode; never requested again
    unconsumable: HashSet<ProducerId>,
}

impl SfuSession {
    pub async fn connect(url: &str, rpc_timeout: Duration) -> Result<Self, ClientError> {
        let network::Connection {
            outbound,
            mut inbound,
        } = network::connect::<SfuClientMessage, SfuServerMessage>(url).await?;

        let peer_id = match tokio::time::timeout(WELCOME_TIMEOUT, inbound.recv()).await {
            Ok(Some(SfuServerMessage::Welcome { peer_id })) => peer_id,
            Ok(Some(other)) => {
                return Err(ClientError::Protocol(format!("Expected welcome, got {:?}", other)));
            }
            Ok(None) => return Err(ClientError::Closed),
            Err(_) => return Err(ClientError::Protocol("Timed out waiting for welcome".to_string())),
        };

        tracing::info!("Connected to SFU as {}", peer_id);

        let rpc = Arc::new(RpcClient::new(outbound, rpc_timeout));
        let (notify_tx, notifications) = mpsc::unbounded_channel();

        // Weak so that dropping the session closes the socket
        let dispatcher = Arc::downgrade(&rpc);
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                match msg {
                    SfuServerMessage::Response(response) => match dispatcher.upgrade() {
                        Some(rpc) => rpc.resolve(response).await,
                        None => break,
                    },
                    SfuServerMessage::Welcome { .. } => {
                        tracing::debug!("Ignoring repeated welcome");
                    }
                    notification => {
                        let _ = notify_tx.send(notification);
                    }
                }
            }

            tracing::warn!("SFU connection closed");
            if let Some(rpc) = dispatcher.upgrade() {
                rpc.cancel_all().await;
            }
        });

        Ok(Self {
            peer_id,
            rpc,
            notifications,
            local_capabilities: local_capabilities(),
            router_capabilities: None,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            unconsumable: HashSet::new(),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn router_capabilities(&self) -> Option<&RtpCapabilities> {
        self.router_capabilities.as_ref()
    }

    pub fn published(&self) -> &HashMap<ProducerId, MediaKind> {
        &self.producers
    }

    pub fn consumed(&self) -> &HashMap<ProducerId, ConsumedTrack> {
        &self.consumers
    }

    pub fn is_unconsumable(&self, producer_id: &ProducerId) -> bool {
        self.unconsumable.contains(producer_id)
    }

    pub async fn join(&mut self, room: &str) -> Result<RtpCapabilities, ClientError> {
        let response = self
            .rpc
            .call(SfuRequest::JoinRoom {
                room_id: room.to_string(),
            })
            .await?;

        match response {
            SfuResponse::Joined { rtp_capabilities } => {
                tracing::info!(
                    "Joined SFU room {} ({} router codecs)",
                    room,
                    rtp_capabilities.codecs.len()
                );
                self.router_capabilities = Some(rtp_capabilities.clone());
                Ok(rtp_capabilities)
            }
            other => Err(unexpected("joinRoom", other)),
        }
    }

    pub async fn create_transport(
        &mut self,
        direction: TransportDirection,
    ) -> Result<TransportParams, ClientError> {
        match self.rpc.call(SfuRequest::CreateTransport { direction }).await? {
            SfuResponse::TransportCreated(params) => {
                tracing::debug!("Created {} transport {}", direction, params.id);
                match direction {
                    TransportDirection::Send => self.send_transport = Some(params.clone()),
                    TransportDirection::Recv => self.recv_transport = Some(params.clone()),
                }
                Ok(params)
            }
            other => Err(unexpected("createTransport", other)),
        }
    }

    pub async fn connect_transport(&mut self, direction: TransportDirection) -> Result<(), ClientError> {
        let request = SfuRequest::ConnectTransport {
            direction,
            dtls_parameters: local_dtls_parameters(),
        };

        match self.rpc.call(request).await? {
            SfuResponse::TransportConnected => Ok(()),
            other => Err(unexpected("connectTransport", other)),
        }
    }

    pub async fn produce(
        &mut self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ClientError> {
        let transport_id = self.transport_id(TransportDirection::Send)?;

        let request = SfuRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
        };

        match self.rpc.call(request).await? {
            SfuResponse::Produced { producer_id } => {
                tracing::info!("Publishing {} as {}", kind, producer_id);
                self.producers.insert(producer_id.clone(), kind);
                Ok(producer_id)
            }
            other => Err(unexpected("produce", other)),
        }
    }

    pub async fn produce_audio(&mut self) -> Result<ProducerId, ClientError> {
        self.produce(MediaKind::Audio, opus_send_parameters()).await
    }

    /// Receive one remote producer.
    ///
    /// Producers already consumed, or known to be undecodable, are skipped
    /// and return `Ok(None)`.
    pub async fn consume(
        &mut self,
        producer_id: ProducerId,
        producer_peer_id: PeerId,
    ) -> Result<Option<ConsumedTrack>, ClientError> {
        if self.consumers.contains_key(&producer_id) || self.unconsumable.contains(&producer_id) {
            return Ok(None);
        }

        let request = SfuRequest::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: self.local_capabilities.clone(),
        };

        let response = match self.rpc.call(request).await {
            Ok(response) => response,
            Err(e) => {
                let e = ClientError::from(e);
                if e.is_capability_mismatch() {
                    tracing::warn!("Cannot decode producer {}; not retrying", producer_id);
                    self.unconsumable.insert(producer_id);
                }
                return Err(e);
            }
        };

        match response {
            SfuResponse::Consumed {
                consumer_id,
                producer_id,
                kind,
                rtp_parameters,
            } => {
                tracing::info!(
                    "Receiving {} from {} via {}",
                    kind,
                    producer_peer_id,
                    consumer_id
                );
                let track = ConsumedTrack {
                    consumer_id,
                    producer_peer_id,
                    kind,
                    rtp_parameters,
                };
                self.consumers.insert(producer_id, track.clone());
                Ok(Some(track))
            }
            other => Err(unexpected("consume", other)),
        }
    }

    pub async fn producers(&self) -> Result<Vec<ProducerInfo>, ClientError> {
        match self.rpc.call(SfuRequest::GetProducers).await? {
            SfuResponse::Producers { producers } => Ok(producers),
            other => Err(unexpected("getProducers", other)),
        }
    }

    /// Consume everything already published in the room
    pub async fn consume_existing(&mut self) -> Result<usize, ClientError> {
        let mut consumed = 0;
        for producer in self.producers().await? {
            match self
                .consume(producer.producer_id, producer.producer_peer_id)
                .await
            {
                Ok(Some(_)) => consumed += 1,
                Ok(None) => {}
                Err(e) if e.is_capability_mismatch() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(consumed)
    }

    pub async fn leave(&mut self) -> Result<(), ClientError> {
        match self.rpc.call(SfuRequest::LeaveRoom).await? {
            SfuResponse::Left => {
                self.router_capabilities = None;
                self.send_transport = None;
                self.recv_transport = None;
                self.producers.clear();
                self.consumers.clear();
                self.unconsumable.clear();
                Ok(())
            }
            other => Err(unexpected("leaveRoom", other)),
        }
    }

    /// Next server-pushed notification, or `None` once the socket is closed
    pub async fn next_notification(&mut self) -> Option<SfuServerMessage> {
        self.notifications.recv().await
    }

    pub async fn handle_notification(&mut self, notification: SfuServerMessage) -> Result<(), ClientError> {
        match notification {
            SfuServerMessage::NewProducer {
                producer_id,
                producer_peer_id,
                kind,
            } => {
                tracing::debug!("Peer {} published {} {}", producer_peer_id, kind, producer_id);
                match self.consume(producer_id, producer_peer_id).await {
                    Err(e) if e.is_capability_mismatch() => Ok(()),
                    Err(e) => Err(e),
                    Ok(_) => Ok(()),
                }
            }
            SfuServerMessage::ConsumerClosed {
                consumer_id,
                producer_id,
            } => {
                if self.consumers.remove(&producer_id).is_some() {
                    tracing::info!("Consumer {} closed", consumer_id);
                }
                Ok(())
            }
            SfuServerMessage::PeerLeft { peer_id } => {
                tracing::info!("Peer {} left the room", peer_id);
                self.consumers
                    .retain(|_, track| track.producer_peer_id != peer_id);
                Ok(())
            }
            SfuServerMessage::Welcome { .. } | SfuServerMessage::Response(_) => Ok(()),
        }
    }

    fn transport_id(&self, direction: TransportDirection) -> Result<TransportId, ClientError> {
        let transport = match direction {
            TransportDirection::Send => self.send_transport.as_ref(),
            TransportDirection::Recv => self.recv_transport.as_ref(),
        };
        transport
            .map(|params| params.id.clone())
            .ok_or_else(|| ClientError::Protocol(format!("No {} transport", direction)))
    }
}

fn unexpected(operation: &str, response: SfuResponse) -> ClientError {
    ClientError::Protocol(format!("Unexpected response to {}: {:?}", operation, response))
}

/// What this client can decode: stereo Opus only
pub fn local_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(OPUS_PAYLOAD_TYPE),
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
        }],
    }
}

pub fn opus_send_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: OPUS_PAYLOAD_TYPE,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::from([("useinbandfec".to_string(), "1".to_string())]),
        }],
        encodings: vec![RtpEncoding {
            ssrc: Some(rand_ssrc()),
        }],
    }
}

fn rand_ssrc() -> u32 {
    rand::thread_rng().r#gen()
}

/// DTLS identity for this session: a fresh sha-256 sized fingerprint
pub fn local_dtls_parameters() -> DtlsParameters {
    let mut rng = rand::thread_rng();
    let value = (0..32)
        .map(|_| format!("{:02X}", rng.r#gen::<u8>()))
        .collect::<Vec<_>>()
        .join(":");

    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value,
        }],
    }
}
