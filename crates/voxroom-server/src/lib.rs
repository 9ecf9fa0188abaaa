//! Voxroom Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod rooms;
pub mod sfu;
pub mod state;
pub mod webrtc;
pub mod ws;

/// Create and configure the server application
pub fn create_app(config: state::Config) -> (axum::Router, state::AppState) {
    let app_state = state::AppState::new(config);
    let router = api::create_router(app_state.clone());
    (router, app_state)
}
