pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod presence;
pub mod rate_limit;
pub mod room_manager;
pub mod sse;
pub mod state;
pub mod ws;

use std::time::Duration;

use axum::Router;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use config::ServerConfig;
use history::{HistoryRecorder, StoreError};
use state::AppState;

/// Build the Axum router and application state from a config, opening the
/// configured match store.
pub async fn build_app(config: ServerConfig) -> Result<(Router<()>, AppState), StoreError> {
    let history = HistoryRecorder::open(&config.history).await?;
    Ok(build_app_with_history(config, history))
}

/// Build the router around an already opened history recorder.
pub fn build_app_with_history(
    config: ServerConfig,
    history: HistoryRecorder,
) -> (Router<()>, AppState) {
    let request_timeout = Duration::from_secs(config.limits.request_timeout_secs);
    let cors = cors_layer(&config.allowed_origins);
    let state = AppState::new(config, history);

    // Bounded request/response endpoints.
    let api_routes = Router::new()
        .route("/rooms", post(api::create_room))
        .route("/rooms/{code}", get(api::get_room))
        .route("/matches", get(api::list_matches))
        .route("/matches/room/{code}", get(api::room_matches))
        .route("/leaderboard", get(api::leaderboard))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    // Long-lived stream, kept out of the request timeout.
    let stream_routes = Router::new().route("/matches/stream", get(sse::match_stream));

    let v1 = api_routes
        .merge(stream_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::api_rate_limit,
        ));

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .nest("/api/v1", v1)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state.clone());

    (app, state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%origin, error = %e, "Ignoring invalid CORS origin");
                None
            },
        })
        .collect();
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}

/// Background maintenance: the idle reaper and API rate-limit bucket
/// cleanup. Both stop when `cancel` fires.
pub fn spawn_background_tasks(state: &AppState, cancel: CancellationToken) {
    room_manager::spawn_idle_reaper(
        std::sync::Arc::clone(&state.rooms),
        state.config.rooms.idle_check_interval(),
        cancel.clone(),
    );

    let limiter = std::sync::Arc::clone(&state.api_limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => limiter.cleanup(Duration::from_secs(300)).await,
            }
        }
    });
}
