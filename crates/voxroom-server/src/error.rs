use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use voxroom_media::EngineError;
use voxroom_protocol::{ProducerId, RpcErrorCode, TransportDirection, TransportId};

use crate::rooms::RegistryError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    BadRequest(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of one SFU operation, reported back to the caller as an RPC error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SfuError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Peer is not in a room")]
    NotInRoom,

    #[error("No {0} transport has been created")]
    NoTransport(TransportDirection),

    #[error("Transport {0} is not this peer's send transport")]
    ForeignTransport(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("RTP capabilities cannot receive producer {0}")]
    CapabilityMismatch(ProducerId),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Peer disconnected")]
    PeerGone,
}

impl SfuError {
    pub fn code(&self) -> RpcErrorCode {
        match self {
            SfuError::Registry(_) | SfuError::ForeignTransport(_) => RpcErrorCode::InvalidRequest,
            SfuError::NotInRoom | SfuError::NoTransport(_) => RpcErrorCode::NotInRoom,
            SfuError::ProducerNotFound(_) => RpcErrorCode::NotFound,
            SfuError::CapabilityMismatch(_) => RpcErrorCode::CapabilityMismatch,
            SfuError::PeerGone => RpcErrorCode::Cancelled,
            SfuError::Engine(e) => match e {
                EngineError::ProducerNotFound(_)
                | EngineError::TransportNotFound(_)
                | EngineError::RouterNotFound(_) => RpcErrorCode::NotFound,
                EngineError::Dtls(_) | EngineError::AlreadyConnected(_) => {
                    RpcErrorCode::TransportFailure
                }
                EngineError::IncompatibleCapabilities(_) => RpcErrorCode::CapabilityMismatch,
                EngineError::UnsupportedCodec(_) | EngineError::WrongDirection { .. } => {
                    RpcErrorCode::InvalidRequest
                }
                EngineError::PortsExhausted => RpcErrorCode::Engine,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_failures_map_to_wire_codes() {
        assert_eq!(
            SfuError::Engine(EngineError::Dtls("bad fingerprint".into())).code(),
            RpcErrorCode::TransportFailure
        );
        assert_eq!(
            SfuError::Engine(EngineError::IncompatibleCapabilities(ProducerId::new("p"))).code(),
            RpcErrorCode::CapabilityMismatch
        );
        assert_eq!(SfuError::PeerGone.code(), RpcErrorCode::Cancelled);
    }

    #[test]
    fn app_error_status_codes() {
        let response = AppError::NotFound("room".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = AppError::BadRequest("name".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
