//! REST endpoints for room creation and discovery.

use axum::{
    Json,
    extract::{Path, State},
    routing::{get, post},
};
use cowrite_core::protocol::{CreateRoomResponse, RoomExistsResponse};

use super::AppState;
use crate::rooms::RegistryStats;

pub fn api_routes() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/create-room", post(create_room))
        .route("/room/{id}/exists", get(room_exists))
        .route("/stats", get(stats))
}

async fn create_room(State(state): State<AppState>) -> Json<CreateRoomResponse> {
    let room = state.registry.create_room().await;
    let room_link = format!(
        "{}/room/{}",
        state.config.app_base_url.trim_end_matches('/'),
        room.id()
    );
    Json(CreateRoomResponse {
        room_id: room.id().to_string(),
        room_link,
    })
}

async fn room_exists(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<RoomExistsResponse> {
    Json(RoomExistsResponse {
        exists: state.registry.exists(&id).await,
    })
}

async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}
