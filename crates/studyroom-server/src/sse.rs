use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use studyroom_core::match_record::MatchRecord;

use crate::state::{AppState, ConnectionGuard};

/// GET /api/v1/matches/stream: SSE feed of newly finished matches.
pub async fn match_stream(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    let max_sse = state.config.limits.max_sse_subscribers;
    let current = state.sse_subscriber_count.load(Ordering::Relaxed);
    if current >= max_sse {
        tracing::warn!(current, max = max_sse, "SSE subscriber limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let guard = ConnectionGuard::new(Arc::clone(&state.sse_subscriber_count));
    let rx = state.history.subscribe().await;

    let stream = BroadcastStream::new(rx).filter_map(move |result: Result<MatchRecord, _>| {
        let _guard = &guard;
        match result {
            Ok(record) => match serde_json::to_string(&record) {
                Ok(json) => Some(Ok(SseEvent::default()
                    .event("match")
                    .data(json)
                    .id(record.id.to_string()))),
                Err(e) => {
                    tracing::warn!(match_id = %record.id, "Failed to serialize match: {e}");
                    None
                },
            },
            Err(e) => {
                tracing::warn!("SSE broadcast receive error: {e}");
                None
            },
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
