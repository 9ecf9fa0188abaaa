//! Media routing primitives for Voxroom
//!
//! This crate provides the seam between session orchestration and media
//! switching:
//! - [`MediaEngine`]: router/transport/producer/consumer operations
//! - Codec capability matching used to decide what a peer can consume
//! - [`LocalEngine`]: an in-process engine modelling the object graph

pub mod codec;
pub mod engine;
pub mod local;

pub use engine::{ConsumerInfo, EngineError, MediaEngine, RouterInfo};
pub use local::{LocalEngine, LocalEngineSettings};
