//! Voxroom client library
//!
//! Peer-side half of the Voxroom protocol: the negotiation state machine,
//! the mesh session with its webrtc-rs links, and the SFU session built on
//! the correlated request channel.

pub mod config;
pub mod error;
pub mod mesh;
pub mod negotiation;
pub mod network;
pub mod rpc;
pub mod sfu;

pub use config::{ClientConfig, SessionMode};
pub use error::{ClientError, LinkError, RpcError};
