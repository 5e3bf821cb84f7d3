use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use studyroom_core::match_record::{LeaderboardEntry, MatchRecord};
use studyroom_core::participant::{ParticipantId, normalize_display_name};
use studyroom_core::room::RoomSnapshot;

use crate::error::AppError;
use crate::room_manager::Member;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Request body for creating a room over HTTP.
#[derive(Debug, Deserialize)]
pub struct CreateRoomBody {
    pub host_id: ParticipantId,
    pub display_name: String,
    pub max_participants: Option<u16>,
}

/// POST /api/v1/rooms: create a waiting room.
///
/// The host subscribes to updates once it connects and joins over the
/// WebSocket.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomSnapshot>), AppError> {
    if !body.host_id.is_valid() {
        return Err(AppError::BadRequest("invalid host id".to_string()));
    }
    let display_name = normalize_display_name(&body.display_name)
        .ok_or_else(|| AppError::BadRequest("invalid display name".to_string()))?;
    let host = Member {
        id: body.host_id,
        display_name,
    };
    let snapshot = state
        .rooms
        .create_room(&host, body.max_participants.map(usize::from), None)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/v1/rooms/{code}
pub async fn get_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RoomSnapshot>, AppError> {
    let code = code.to_ascii_uppercase();
    Ok(Json(state.rooms.snapshot(&code).await?))
}

#[derive(Debug, Deserialize)]
pub struct MatchesQuery {
    pub participant: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/v1/matches: recent matches, optionally for one participant.
pub async fn list_matches(
    State(state): State<AppState>,
    Query(query): Query<MatchesQuery>,
) -> Result<Json<Vec<MatchRecord>>, AppError> {
    let limit = clamp_limit(query.limit);
    let records = match query.participant {
        Some(id) => {
            let id = ParticipantId::new(id);
            if !id.is_valid() {
                return Err(AppError::BadRequest("invalid participant id".to_string()));
            }
            state.history.by_participant(&id, limit).await
        },
        None => state.history.recent(limit).await,
    };
    Ok(Json(records))
}

/// GET /api/v1/matches/room/{code}: every recorded match of a room code.
pub async fn room_matches(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<Vec<MatchRecord>>, AppError> {
    let code = code.to_ascii_uppercase();
    let records = state.history.by_room(&code).await;
    if records.is_empty() {
        return Err(AppError::NotFound(format!("no matches recorded for room {code}")));
    }
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/leaderboard
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Json<Vec<LeaderboardEntry>> {
    Json(state.history.leaderboard(clamp_limit(query.limit)).await)
}
