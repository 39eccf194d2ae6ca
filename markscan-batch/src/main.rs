//! markscan-batch - Batch Classification Orchestration Service
//!
//! Accepts batches of items over HTTP, drives them through the external
//! detector service, and streams progress over WebSocket. Incomplete
//! batches found on disk are resumed before the listener binds.

use anyhow::Result;
use markscan_batch::detector::DetectorClient;
use markscan_batch::tasks::BackgroundTasks;
use markscan_batch::{build_router, recovery, AppState};
use markscan_common::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting markscan-batch service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)?;
    info!("Data directory: {}", config.data_dir.display());
    info!("Detector: {}", config.detector_url);

    let classifier = Arc::new(DetectorClient::new(
        config.detector_url.clone(),
        Duration::from_secs(config.detector_timeout_secs),
    )?);

    let port = config.port;
    let state = AppState::new(config, classifier)?;

    // Resume incomplete batches before accepting new registrations
    let resumed = recovery::resume_pending(&state).await?;
    info!(resumed, "Startup recovery scan complete");

    let tasks = BackgroundTasks::spawn(&state);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Listening on http://0.0.0.0:{}", port);
    info!("Health check: http://0.0.0.0:{}/health", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tasks.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
