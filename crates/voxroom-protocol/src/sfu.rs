//! SFU request/response protocol
//!
//! Every client operation travels as an [`RpcRequest`] carrying a
//! correlation id; the server answers each one with exactly one
//! [`RpcResponse`] bearing the same id. Notifications are pushed without
//! an id.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::PeerId;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Media router owned by one room
    RouterId
);
string_id!(TransportId);
string_id!(ProducerId);
string_id!(ConsumerId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportDirection::Send => f.write_str("send"),
            TransportDirection::Recv => f.write_str("recv"),
        }
    }
}

/// One codec a router (or a receiving peer) is able to handle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

/// Codec actually negotiated for one producer or consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpEncoding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncoding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// Candidate advertised by the media engine for one transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportIceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<TransportIceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub producer_peer_id: PeerId,
    pub kind: MediaKind,
}

/// Operations a client may invoke on the SFU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SfuRequest {
    JoinRoom {
        room_id: String,
    },
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    GetProducers,
    LeaveRoom,
}

impl SfuRequest {
    /// Operation name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            SfuRequest::JoinRoom { .. } => "joinRoom",
            SfuRequest::CreateTransport { .. } => "createTransport",
            SfuRequest::ConnectTransport { .. } => "connectTransport",
            SfuRequest::Produce { .. } => "produce",
            SfuRequest::Consume { .. } => "consume",
            SfuRequest::GetProducers => "getProducers",
            SfuRequest::LeaveRoom => "leaveRoom",
        }
    }
}

/// Success payloads, one per [`SfuRequest`] variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum SfuResponse {
    Joined {
        rtp_capabilities: RtpCapabilities,
    },
    TransportCreated(TransportParams),
    TransportConnected,
    Produced {
        producer_id: ProducerId,
    },
    Consumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Producers {
        producers: Vec<ProducerInfo>,
    },
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcErrorCode {
    InvalidRequest,
    NotInRoom,
    NotFound,
    CapabilityMismatch,
    TransportFailure,
    Engine,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub request: SfuRequest,
}

/// Acknowledgment for one [`RpcRequest`]: exactly one of `data` or `error` is set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SfuResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<RpcErrorCode>,
}

/// Error half of an [`RpcResponse`] once decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: u64, data: SfuResponse) -> Self {
        Self {
            id,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn err(id: u64, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            data: None,
            error: Some(message.into()),
            code: Some(code),
        }
    }

    pub fn into_result(self) -> Result<SfuResponse, RpcFailure> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(message)) => Err(RpcFailure {
                code: self.code.unwrap_or(RpcErrorCode::Engine),
                message,
            }),
            (None, None) => Err(RpcFailure {
                code: RpcErrorCode::InvalidRequest,
                message: "Response carried neither data nor error".to_string(),
            }),
        }
    }
}

/// Frames sent from client to server on the SFU socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SfuClientMessage {
    Request(RpcRequest),
}

/// Frames sent from server to client on the SFU socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SfuServerMessage {
    Welcome {
        peer_id: PeerId,
    },
    Response(RpcResponse),
    /// A co-member started producing; the receiver may consume it
    NewProducer {
        producer_id: ProducerId,
        producer_peer_id: PeerId,
        kind: MediaKind,
    },
    /// A consumer was closed because its producer went away
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
}
