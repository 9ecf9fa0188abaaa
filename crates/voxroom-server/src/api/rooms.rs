use crate::error::{AppError, Result};
use crate::rooms::RoomSummary;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use voxroom_protocol::{PeerId, RoomId};

#[derive(Debug, Serialize)]
pub struct RoomDetails {
    pub room_id: RoomId,
    pub members: Vec<PeerId>,
}

pub async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    Json(state.rooms.summaries().await)
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomDetails>> {
    let room_id = RoomId::sanitize(&name).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let members = state.rooms.members_of(&room_id).await;
    if members.is_empty() {
        return Err(AppError::NotFound(format!("Room {}", room_id)));
    }

    Ok(Json(RoomDetails { room_id, members }))
}
