use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use crate::history::HistoryStats;
use crate::room_manager::RoomStats;
use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub rooms: RoomStats,
    pub history: HistoryStats,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
    pub sse: usize,
    pub online_participants: usize,
}

/// Server status, connection counts, room and history counters as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let websocket = state.ws_connection_count.load(Ordering::Relaxed);
    let sse = state.sse_subscriber_count.load(Ordering::Relaxed);
    let online_participants = state.presence.count().await;

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo {
            websocket,
            sse,
            online_participants,
        },
        rooms: state.rooms.stats().await,
        history: state.history.stats().await,
    })
}

/// Readiness: the service accepts commands until the WebSocket cap is hit.
pub async fn readiness_check(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= state.config.limits.max_ws_connections {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "not ready: connection limit reached",
        );
    }
    (StatusCode::OK, "ready")
}
