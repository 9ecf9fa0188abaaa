//! Media engine seam
//!
//! The orchestrator never switches media itself; it drives an engine that
//! owns routers, transports, producers and consumers and addresses them by
//! id. Close operations are idempotent: closing an unknown or already closed
//! object is a no-op.

use async_trait::async_trait;
use thiserror::Error;
use voxroom_protocol::{
    ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId, TransportParams,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Router not found: {0}")]
    RouterNotFound(RouterId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Transport {0} is already connected")]
    AlreadyConnected(TransportId),

    #[error("Transport {transport} is a {actual} transport")]
    WrongDirection {
        transport: TransportId,
        actual: TransportDirection,
    },

    #[error("DTLS handshake failed: {0}")]
    Dtls(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("RTP capabilities cannot receive producer {0}")]
    IncompatibleCapabilities(ProducerId),

    #[error("No free RTC port left")]
    PortsExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self) -> Result<RouterInfo, EngineError>;

    /// Close a router together with everything created on it
    async fn close_router(&self, router_id: &RouterId);

    async fn create_transport(
        &self,
        router_id: &RouterId,
        direction: TransportDirection,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    /// Close a transport together with its producers and consumers
    async fn close_transport(&self, transport_id: &TransportId);

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Close a producer together with every consumer sourced from it
    async fn close_producer(&self, producer_id: &ProducerId);

    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId);
}
