use thiserror::Error;
use voxroom_protocol::{RpcErrorCode, RpcFailure};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// Failures that must not be retried
    pub fn is_capability_mismatch(&self) -> bool {
        matches!(
            self,
            ClientError::Rpc(RpcError::Remote {
                code: RpcErrorCode::CapabilityMismatch,
                ..
            })
        )
    }
}

/// Outcome of a correlated request that did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Request #{id} ({operation}) timed out")]
    Timeout { id: u64, operation: &'static str },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Not connected")]
    Disconnected,

    #[error("Server rejected request ({code:?}): {message}")]
    Remote { code: RpcErrorCode, message: String },
}

impl From<RpcFailure> for RpcError {
    fn from(failure: RpcFailure) -> Self {
        match failure.code {
            RpcErrorCode::Cancelled => RpcError::Cancelled,
            code => RpcError::Remote {
                code,
                message: failure.message,
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Link is closed")]
    Closed,
}
