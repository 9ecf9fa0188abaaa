mod rooms;

use crate::state::AppState;
use crate::{sfu, ws};
use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Room inspection
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{name}", get(rooms::get_room))
        // WebRTC configuration
        .route("/api/rtc/ice-servers", get(crate::webrtc::get_ice_servers))
        // Mesh signaling
        .route("/ws", get(ws::handler::ws_handler))
        // SFU signaling
        .route("/sfu", get(sfu::handler::sfu_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
