//! markscan-batch - Batch Classification Orchestration Service
//!
//! Accepts batches of items (uploaded payloads or textual references),
//! drives each item through an external detector service, and streams
//! per-item progress to WebSocket peers. Progress survives a crash via
//! per-batch checkpoint records; incomplete batches resume at startup.

pub mod api;
pub mod channel;
pub mod checkpoint;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod recovery;
pub mod tasks;

pub use crate::error::{ApiError, ApiResult};

use crate::channel::ChannelManager;
use crate::checkpoint::CheckpointStore;
use crate::detector::Classifier;
use crate::dispatcher::{dispatch_parallelism, Dispatcher};
use crate::ledger::ProgressLedger;
use axum::Router;
use chrono::{DateTime, Utc};
use markscan_common::config::Config;
use markscan_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<ProgressLedger>,
    pub checkpoints: Arc<CheckpointStore>,
    pub channels: Arc<ChannelManager>,
    pub classifier: Arc<dyn Classifier>,
    /// Global in-flight classification cap shared by every batch
    pub dispatch_permits: Arc<Semaphore>,
    /// Serializes the check-then-save of item submission, so a batch can
    /// never be dispatched twice by racing requests
    pub submission_lock: Arc<Mutex<()>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, classifier: Arc<dyn Classifier>) -> Result<Self> {
        let checkpoints = CheckpointStore::new(&config.data_dir)?;
        let idle_expiry = Duration::from_secs(config.batch_idle_expiry_secs);
        Ok(Self {
            config: Arc::new(config),
            ledger: Arc::new(ProgressLedger::new(idle_expiry)),
            checkpoints: Arc::new(checkpoints),
            channels: Arc::new(ChannelManager::new()),
            classifier,
            dispatch_permits: Arc::new(Semaphore::new(dispatch_parallelism())),
            submission_lock: Arc::new(Mutex::new(())),
            startup_time: Utc::now(),
        })
    }

    /// Orchestrator handle bound to this state's shared components
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.ledger),
            Arc::clone(&self.checkpoints),
            Arc::clone(&self.channels),
            Arc::clone(&self.classifier),
            Arc::clone(&self.dispatch_permits),
        )
    }
}

/// Per-request body cap; batches arrive as one multipart request
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::extract::DefaultBodyLimit;
    use axum::routing::{get, post};

    Router::new()
        .route("/api/batch/register", post(api::batch::register))
        .route("/api/batch/:batch_id/items", post(api::batch::submit_items))
        .route("/api/batch/:batch_id/status", get(api::batch::status))
        .route("/ws/batch/:batch_id", get(api::ws::batch_socket))
        .route("/ws/client/:subscriber_id", get(api::ws::client_socket))
        .route("/health", get(api::health::health))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
