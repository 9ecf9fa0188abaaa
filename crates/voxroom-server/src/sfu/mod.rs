//! SFU (Selective Forwarding Unit) signaling
//!
//! Clients provision transports, producers and consumers over a correlated
//! request/response protocol on `/sfu`. Media switching itself is delegated
//! to a [`voxroom_media::MediaEngine`].

pub mod handler;
mod orchestrator;
mod rpc;

pub use orchestrator::SfuOrchestrator;
pub use rpc::Responder;
