//! Shared protocol definitions for Voxroom
//!
//! Mesh signaling frames live in [`messages`], SFU RPC frames in [`sfu`],
//! identifiers and WebRTC descriptors in [`types`].

pub mod messages;
pub mod sfu;
pub mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use sfu::*;
pub use types::*;
