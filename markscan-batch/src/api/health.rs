//! Health check endpoint

use crate::AppState;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::json;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "markscan-batch",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": (Utc::now() - state.startup_time).num_seconds(),
        "active_batches": state.ledger.len().await,
    }))
}
