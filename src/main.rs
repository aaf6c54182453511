use anyhow::Context;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_ingest::{config::Config, controllers, AppState};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;

    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&config.app.rust_log));
    if config.app.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(environment = %config.app.environment, "Starting event ingestion service");

    let app_state = AppState::from_config(config.clone()).await?;
    let cancel = app_state.ingest.cancellation_token();

    // --- Start background tasks ---

    // Полный прогон и fixup по расписанию
    if config.ingest.interval_seconds > 0 {
        let state = app_state.clone();
        let cancel = cancel.clone();
        let period = Duration::from_secs(config.ingest.interval_seconds);
        task::spawn(async move {
            loop {
                state.ingest.ingest_all().await;
                state.ingest.fixup().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
            info!("Background ingestion loop stopped");
        });
    } else {
        info!("Background ingestion loop disabled");
    }

    // --- Start the web server ---

    let app = Router::new()
        .route("/", get(|| async { "Event Ingest v1.0" }))
        .route("/health", get(|| async { "OK" }))
        .nest("/api", controllers::routes())
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let ip = config
        .app
        .host
        .parse()
        .with_context(|| format!("Invalid HOST {}", config.app.host))?;
    let addr = SocketAddr::new(ip, config.app.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Ctrl-C отменяет все текущие вызовы конвейера и останавливает сервер.
async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
    cancel.cancel();
}
