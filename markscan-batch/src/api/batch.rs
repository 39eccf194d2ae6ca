//! Batch lifecycle endpoints
//!
//! Registration declares the batch (item count, optional owning subscriber,
//! optional chunk size) and returns its id; items arrive in a second call,
//! either as multipart uploads or as a JSON reference list. Dispatch starts
//! as soon as the declared number of items has been received.

use crate::checkpoint::{BatchStatus, CheckpointRecord, Counts};
use crate::detector::WorkItem;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::Json;
use markscan_common::events::percentage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Number of items this batch will contain
    pub total: usize,
    /// Subscriber that owns this batch, for client-directed delivery
    #[serde(default)]
    pub subscriber_id: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub batch_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ItemsRequest {
    pub references: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ItemsQuery {
    /// Overrides the chunk size chosen at registration
    #[serde(default)]
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub batch_id: Uuid,
    pub accepted: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub counts: Counts,
    pub progress_percent: f64,
}

/// POST /api/batch/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    if request.chunk_size == Some(0) {
        return Err(ApiError::BadRequest(
            "chunk_size must be at least 1".to_string(),
        ));
    }

    let batch_id = Uuid::new_v4();
    let chunk_size = request
        .chunk_size
        .unwrap_or(state.config.default_chunk_size);
    state.checkpoints.create_summary(batch_id, request.total)?;
    state.ledger.register(batch_id, request.total).await;
    if let Some(subscriber_id) = &request.subscriber_id {
        state.channels.associate(subscriber_id, batch_id).await;
    }

    if request.total == 0 {
        // Nothing to receive; the batch is terminal the moment it exists
        let dispatcher = state.dispatcher();
        tokio::spawn(async move { dispatcher.run(batch_id, chunk_size, Vec::new()).await });
    } else {
        state.checkpoints.save_initial(&CheckpointRecord {
            batch_id,
            subscriber_id: request.subscriber_id.clone(),
            chunk_size,
            total: request.total,
            processed: 0,
            valid: 0,
            invalid: 0,
            remaining: Vec::new(),
        })?;
    }

    tracing::info!(batch_id = %batch_id, total = request.total, "Batch registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { batch_id })))
}

/// POST /api/batch/{batch_id}/items
///
/// Accepts either `multipart/form-data` (file parts plus `reference` text
/// fields) or `application/json` `{references: [...]}`; `?chunk_size=N`
/// overrides the chunk size chosen at registration. The item count must
/// match the registered total; a second submission is a conflict.
pub async fn submit_items(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<ItemsQuery>,
    request: Request,
) -> ApiResult<(StatusCode, Json<ItemsResponse>)> {
    if query.chunk_size == Some(0) {
        return Err(ApiError::BadRequest(
            "chunk_size must be at least 1".to_string(),
        ));
    }

    // Fast fail before consuming the body; re-checked under the lock below
    load_pending(&state, batch_id)?;

    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    let items = if content_type.starts_with("application/json") {
        let Json(body) = Json::<ItemsRequest>::from_request(request, &state)
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        body.references
            .into_iter()
            .map(|url| WorkItem::Reference { url })
            .collect()
    } else if content_type.starts_with("multipart/form-data") {
        collect_multipart(&state, batch_id, request).await?
    } else {
        return Err(ApiError::BadRequest(
            "expected multipart/form-data or application/json".to_string(),
        ));
    };

    // Only one submission may pass the pending check and save; a racing
    // request sees the saved remaining list and conflicts
    let _guard = state.submission_lock.lock().await;
    let mut record = load_pending(&state, batch_id)?;

    if items.len() != record.total {
        return Err(ApiError::BadRequest(format!(
            "batch declared {} items, received {}",
            record.total,
            items.len()
        )));
    }

    if let Some(chunk_size) = query.chunk_size {
        record.chunk_size = chunk_size;
    }
    record.remaining = items.clone();
    state.checkpoints.save_initial(&record)?;

    let dispatcher = state.dispatcher();
    let chunk_size = record.chunk_size;
    tokio::spawn(async move { dispatcher.run(batch_id, chunk_size, items).await });

    tracing::info!(batch_id = %batch_id, accepted = record.total, "Batch items accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(ItemsResponse {
            batch_id,
            accepted: record.total,
        }),
    ))
}

/// Load the checkpoint of a batch still waiting for its items
fn load_pending(state: &AppState, batch_id: Uuid) -> ApiResult<CheckpointRecord> {
    let record = state.checkpoints.load(batch_id)?.ok_or_else(|| {
        match state.checkpoints.load_summary(batch_id) {
            Ok(_) => ApiError::Conflict(format!("batch already dispatched: {}", batch_id)),
            Err(_) => ApiError::NotFound(format!("batch not found: {}", batch_id)),
        }
    })?;
    if !record.remaining.is_empty() {
        return Err(ApiError::Conflict(format!(
            "items already submitted for batch: {}",
            batch_id
        )));
    }
    Ok(record)
}

async fn collect_multipart(
    state: &AppState,
    batch_id: Uuid,
    request: Request,
) -> ApiResult<Vec<WorkItem>> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let mut items = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if let Some(name) = field.file_name().map(str::to_string) {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            state.checkpoints.stage_payload(batch_id, &name, &data)?;
            items.push(WorkItem::File { name });
        } else if field.name() == Some("reference") {
            let url = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            items.push(WorkItem::Reference { url });
        } else {
            return Err(ApiError::BadRequest(format!(
                "unexpected field: {}",
                field.name().unwrap_or("<unnamed>")
            )));
        }
    }
    Ok(items)
}

/// GET /api/batch/{batch_id}/status
///
/// Live counters win over the stored summary while the batch is tracked;
/// after completion the finalized summary is the answer.
pub async fn status(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> ApiResult<Json<StatusResponse>> {
    let summary = state.checkpoints.load_summary(batch_id)?;
    let counts = match state.ledger.snapshot(batch_id).await {
        Some(snapshot) => Counts {
            valid: snapshot.valid,
            invalid: snapshot.invalid,
            total: snapshot.total,
        },
        None => summary.counts,
    };

    Ok(Json(StatusResponse {
        batch_id,
        status: summary.status,
        counts,
        progress_percent: percentage(counts.valid + counts.invalid, counts.total),
    }))
}
