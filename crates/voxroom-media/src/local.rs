//! In-process media engine
//!
//! Models the router/transport/producer/consumer graph, codec negotiation and
//! port allocation without moving any RTP. Useful as the default engine for
//! signaling-only deployments and for tests.

use async_trait::async_trait;
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;
use voxroom_protocol::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, IceParameters, MediaKind, ProducerId,
    RouterId, RtpCapabilities, RtpCodecCapability, RtpEncoding, RtpParameters,
    TransportDirection, TransportIceCandidate, TransportId, TransportParams,
};

use crate::codec::{default_media_codecs, kind_of_mime, router_capabilities, select_consumer_codec, unsupported_codec};
use crate::engine::{ConsumerInfo, EngineError, MediaEngine, RouterInfo};

const FINGERPRINT_ALGORITHMS: &[&str] = &["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

#[derive(Debug, Clone)]
pub struct LocalEngineSettings {
    /// Address advertised in ICE candidates
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for LocalEngineSettings {
    fn default() -> Self {
        Self {
            announced_ip: "127.0.0.1".to_string(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            media_codecs: default_media_codecs(),
        }
    }
}

struct RouterState {
    rtp_capabilities: RtpCapabilities,
    transports: HashSet<TransportId>,
}

struct TransportState {
    router_id: RouterId,
    direction: TransportDirection,
    port: u16,
    connected: bool,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct ProducerState {
    router_id: RouterId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct ConsumerState {
    transport_id: TransportId,
    producer_id: ProducerId,
}

#[derive(Default)]
struct EngineState {
    routers: HashMap<RouterId, RouterState>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
    ports_in_use: HashSet<u16>,
    next_port: u16,
}

impl EngineState {
    fn allocate_port(&mut self, min: u16, max: u16) -> Result<u16, EngineError> {
        let span = u32::from(max.saturating_sub(min)) + 1;
        if self.next_port < min || self.next_port > max {
            self.next_port = min;
        }

        for _ in 0..span {
            let candidate = self.next_port;
            self.next_port = if candidate >= max { min } else { candidate + 1 };
            if self.ports_in_use.insert(candidate) {
                return Ok(candidate);
            }
        }

        Err(EngineError::PortsExhausted)
    }

    fn remove_consumer(&mut self, consumer_id: &ConsumerId) {
        let Some(consumer) = self.consumers.remove(consumer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
    }

    fn remove_producer(&mut self, producer_id: &ProducerId) {
        let Some(producer) = self.producers.remove(producer_id) else {
            return;
        };
        for consumer_id in &producer.consumers {
            self.remove_consumer(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
    }

    fn remove_transport(&mut self, transport_id: &TransportId) {
        let Some(transport) = self.transports.remove(transport_id) else {
            return;
        };
        for producer_id in &transport.producers {
            self.remove_producer(producer_id);
        }
        for consumer_id in &transport.consumers {
            self.remove_consumer(consumer_id);
        }
        self.ports_in_use.remove(&transport.port);
        if let Some(router) = self.routers.get_mut(&transport.router_id) {
            router.transports.remove(transport_id);
        }
    }
}

pub struct LocalEngine {
    settings: LocalEngineSettings,
    state: RwLock<EngineState>,
}

impl LocalEngine {
    pub fn new(settings: LocalEngineSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(EngineState::default()),
        }
    }

    pub async fn router_count(&self) -> usize {
        self.state.read().await.routers.len()
    }

    pub async fn transport_count(&self) -> usize {
        self.state.read().await.transports.len()
    }

    pub async fn producer_count(&self) -> usize {
        self.state.read().await.producers.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.state.read().await.consumers.len()
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn random_fingerprint() -> String {
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| format!("{:02X}", rng.r#gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new(LocalEngineSettings::default())
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self) -> Result<RouterInfo, EngineError> {
        let id = RouterId::new(Self::new_id());
        let rtp_capabilities = router_capabilities(&self.settings.media_codecs);

        self.state.write().await.routers.insert(
            id.clone(),
            RouterState {
                rtp_capabilities: rtp_capabilities.clone(),
                transports: HashSet::new(),
            },
        );

        tracing::debug!("Created router {}", id);

        Ok(RouterInfo {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &RouterId) {
        let mut state = self.state.write().await;
        let Some(router) = state.routers.remove(router_id) else {
            return;
        };
        for transport_id in &router.transports {
            state.remove_transport(transport_id);
        }
        tracing::debug!("Closed router {}", router_id);
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportParams, EngineError> {
        let mut state = self.state.write().await;
        if !state.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.clone()));
        }

        let port = state.allocate_port(self.settings.rtc_min_port, self.settings.rtc_max_port)?;
        let id = TransportId::new(Self::new_id());

        state.transports.insert(
            id.clone(),
            TransportState {
                router_id: router_id.clone(),
                direction,
                port,
                connected: false,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(router) = state.routers.get_mut(router_id) {
            router.transports.insert(id.clone());
        }

        let mut rng = rand::thread_rng();
        let params = TransportParams {
            id: id.clone(),
            direction,
            ice_parameters: IceParameters {
                username_fragment: Alphanumeric.sample_string(&mut rng, 16),
                password: Alphanumeric.sample_string(&mut rng, 32),
                ice_lite: true,
            },
            ice_candidates: vec![TransportIceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.settings.announced_ip.clone(),
                port,
                protocol: "udp".to_string(),
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: Self::random_fingerprint(),
                }],
            },
        };

        tracing::debug!("Created {} transport {} on port {}", direction, id, port);

        Ok(params)
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;

        if transport.connected {
            return Err(EngineError::AlreadyConnected(transport_id.clone()));
        }

        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Dtls("no fingerprint supplied".to_string()));
        }
        for fingerprint in &dtls_parameters.fingerprints {
            let algorithm = fingerprint.algorithm.to_ascii_lowercase();
            if !FINGERPRINT_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(EngineError::Dtls(format!(
                    "unsupported fingerprint algorithm {}",
                    fingerprint.algorithm
                )));
            }
            if fingerprint.value.trim().is_empty() {
                return Err(EngineError::Dtls("empty fingerprint".to_string()));
            }
        }

        transport.connected = true;
        tracing::debug!("Transport {} connected", transport_id);
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) {
        self.state.write().await.remove_transport(transport_id);
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        let mut state = self.state.write().await;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;

        if transport.direction != TransportDirection::Send {
            return Err(EngineError::WrongDirection {
                transport: transport_id.clone(),
                actual: transport.direction,
            });
        }

        let router_id = transport.router_id.clone();
        let router = state
            .routers
            .get(&router_id)
            .ok_or_else(|| EngineError::RouterNotFound(router_id.clone()))?;

        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::UnsupportedCodec("no codecs in RTP parameters".to_string()));
        }
        if let Some(codec) = unsupported_codec(&router.rtp_capabilities, &rtp_parameters) {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }
        if let Some(codec) = rtp_parameters
            .codecs
            .iter()
            .find(|codec| kind_of_mime(&codec.mime_type) != Some(kind))
        {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} is not a {:?} codec",
                codec.mime_type, kind
            )));
        }

        let id = ProducerId::new(Self::new_id());
        state.producers.insert(
            id.clone(),
            ProducerState {
                router_id,
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters,
                consumers: HashSet::new(),
            },
        );
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.producers.insert(id.clone());
        }

        tracing::debug!("Created {:?} producer {} on transport {}", kind, id, transport_id);
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &ProducerId) {
        self.state.write().await.remove_producer(producer_id);
    }

    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let state = self.state.read().await;
        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| &p.router_id == router_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;

        Ok(select_consumer_codec(&producer.rtp_parameters, rtp_capabilities).is_some())
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError> {
        let mut state = self.state.write().await;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;

        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::WrongDirection {
                transport: transport_id.clone(),
                actual: transport.direction,
            });
        }

        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| p.router_id == transport.router_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;

        let codec = select_consumer_codec(&producer.rtp_parameters, rtp_capabilities)
            .ok_or_else(|| EngineError::IncompatibleCapabilities(producer_id.clone()))?;
        let kind = producer.kind;

        let id = ConsumerId::new(Self::new_id());
        let rtp_parameters = RtpParameters {
            mid: Some(transport.consumers.len().to_string()),
            codecs: vec![codec],
            encodings: vec![RtpEncoding {
                ssrc: Some(rand::thread_rng().r#gen()),
            }],
        };

        state.consumers.insert(
            id.clone(),
            ConsumerState {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
            },
        );
        if let Some(transport) = state.transports.get_mut(transport_id) {
            transport.consumers.insert(id.clone());
        }
        if let Some(producer) = state.producers.get_mut(producer_id) {
            producer.consumers.insert(id.clone());
        }

        tracing::debug!("Created consumer {} for producer {}", id, producer_id);

        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.state.write().await.remove_consumer(consumer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::OPUS_CLOCK_RATE;
    use std::collections::BTreeMap;
    use voxroom_protocol::RtpCodecParameters;

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: OPUS_CLOCK_RATE,
                channels: Some(2),
                parameters: BTreeMap::new(),
            }],
            encodings: vec![RtpEncoding { ssrc: Some(1111) }],
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn closing_producer_closes_its_consumers() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let send = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(&router.id, TransportDirection::Recv).await.unwrap();

        let producer = engine
            .produce(&send.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        engine
            .consume(&recv.id, &producer, &router.rtp_capabilities)
            .await
            .unwrap();
        assert_eq!(engine.consumer_count().await, 1);

        engine.close_producer(&producer).await;
        assert_eq!(engine.producer_count().await, 0);
        assert_eq!(engine.consumer_count().await, 0);
    }

    #[tokio::test]
    async fn connect_twice_is_rejected() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let send = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();

        tokio_test::assert_ok!(engine.connect_transport(&send.id, dtls()).await);
        assert_eq!(
            engine.connect_transport(&send.id, dtls()).await,
            Err(EngineError::AlreadyConnected(send.id.clone()))
        );
    }

    #[tokio::test]
    async fn connect_without_fingerprint_fails_fast() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let send = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();

        let result = engine
            .connect_transport(
                &send.id,
                DtlsParameters {
                    role: DtlsRole::Client,
                    fingerprints: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::Dtls(_))));
    }

    #[tokio::test]
    async fn produce_rejects_codec_outside_router() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let send = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();

        let mut params = opus_parameters();
        params.codecs[0].mime_type = "audio/G722".to_string();
        params.codecs[0].clock_rate = 8000;
        params.codecs[0].channels = None;

        let result = engine.produce(&send.id, MediaKind::Audio, params).await;
        assert_eq!(result, Err(EngineError::UnsupportedCodec("audio/G722".to_string())));
    }

    #[tokio::test]
    async fn produce_on_recv_transport_is_rejected() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let recv = engine.create_transport(&router.id, TransportDirection::Recv).await.unwrap();

        let result = engine.produce(&recv.id, MediaKind::Audio, opus_parameters()).await;
        assert!(matches!(result, Err(EngineError::WrongDirection { .. })));
    }

    #[tokio::test]
    async fn ports_are_released_with_transports() {
        let engine = LocalEngine::new(LocalEngineSettings {
            rtc_min_port: 50000,
            rtc_max_port: 50000,
            ..Default::default()
        });
        let router = engine.create_router().await.unwrap();
        let first = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();
        assert_eq!(first.ice_candidates[0].port, 50000);

        assert_eq!(
            engine.create_transport(&router.id, TransportDirection::Recv).await,
            Err(EngineError::PortsExhausted)
        );

        engine.close_transport(&first.id).await;
        tokio_test::assert_ok!(engine.create_transport(&router.id, TransportDirection::Recv).await);
    }

    #[tokio::test]
    async fn closing_router_releases_everything() {
        let engine = LocalEngine::default();
        let router = engine.create_router().await.unwrap();
        let send = engine.create_transport(&router.id, TransportDirection::Send).await.unwrap();
        engine
            .produce(&send.id, MediaKind::Audio, opus_parameters())
            .await
            .unwrap();

        engine.close_router(&router.id).await;
        assert_eq!(engine.router_count().await, 0);
        assert_eq!(engine.transport_count().await, 0);
        assert_eq!(engine.producer_count().await, 0);

        // Idempotent
        engine.close_router(&router.id).await;
    }
}
