//! Health check and statistics endpoints
//!
//! `/health` reports whether the media engine is alive; `/api/stats`
//! exposes a point-in-time snapshot of the room directory.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use sfumeet_sfu::{DirectoryStats, RoomStats};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/stats", get(stats))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine_alive: bool,
    pub rooms: usize,
}

/// 200 while the engine runs and new work is accepted, 503 afterwards
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let engine_alive = state.directory.is_engine_alive();
    let healthy = engine_alive && !state.directory.is_shutdown();
    let body = HealthResponse {
        status: if healthy { "ok" } else { "unavailable" },
        engine_alive,
        rooms: state.directory.room_count(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub totals: DirectoryStats,
    pub room_stats: Vec<RoomStats>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        totals: state.directory.stats().await,
        room_stats: state.directory.room_stats().await,
    })
}
