use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use studyroom_server::config::ServerConfig;
use studyroom_server::{build_app, spawn_background_tasks};

#[tokio::main]
async fn main() {
    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Studyroom server starting");

    let config = ServerConfig::load();
    config.validate();
    let listen_addr = config.listen_addr.clone();

    let (app, state) = match build_app(config).await {
        Ok(built) => built,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open match history");
            std::process::exit(1);
        },
    };

    let cancel = CancellationToken::new();
    spawn_background_tasks(&state, cancel.clone());

    let listener = match tokio::net::TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %listen_addr, error = %e, "Failed to bind");
            std::process::exit(1);
        },
    };
    tracing::info!(addr = %listen_addr, "Listening");

    let shutdown = cancel.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
        shutdown.cancel();
    })
    .await;

    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
    }
    cancel.cancel();
    state.history.flush().await;
    tracing::info!("Studyroom server stopped");
}

/// `RUST_LOG` filters; `STUDYROOM_LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("STUDYROOM_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
