//! Live-channel event types
//!
//! The wire vocabulary spoken over batch- and client-scoped WebSocket
//! connections. Every server frame is one JSON object tagged by `event`;
//! client frames are tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-to-client events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    /// One item finished (primary or retry pass)
    Progress {
        batch_id: Uuid,
        processed: usize,
        total: usize,
        valid: usize,
        invalid: usize,
        percentage: f64,
        current_item: String,
        timestamp: DateTime<Utc>,
    },

    /// The bounded retry pass is starting
    RetryStart {
        batch_id: Uuid,
        retry_total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Terminal event, delivered exactly once per batch
    Complete {
        batch_id: Uuid,
        processed: usize,
        total: usize,
        valid: usize,
        invalid: usize,
        percentage: f64,
        timestamp: DateTime<Utc>,
    },

    /// Orchestration failure for this batch; per-item errors never raise this
    Error {
        batch_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Welcome frame on a client-scoped connection; lists the batches
    /// reinstated from a recovery record (empty on a fresh connect)
    Connected {
        subscriber_id: String,
        recovered_batches: Vec<Uuid>,
        timestamp: DateTime<Utc>,
    },

    /// Liveness ack for a client heartbeat
    Pong { timestamp: DateTime<Utc> },
}

impl BatchEvent {
    /// Event tag as it appears on the wire, for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            BatchEvent::Progress { .. } => "progress",
            BatchEvent::RetryStart { .. } => "retry_start",
            BatchEvent::Complete { .. } => "complete",
            BatchEvent::Error { .. } => "error",
            BatchEvent::Connected { .. } => "connected",
            BatchEvent::Pong { .. } => "pong",
        }
    }
}

/// Client-to-server messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Heartbeat; refreshes the subscriber's liveness timestamp
    Ping,
}

/// Completion percentage with two-decimal rounding; an empty batch is 100%
pub fn percentage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((processed as f64 / total as f64) * 10_000.0).round() / 100.0
}
