//! WebSocket endpoints
//!
//! Both endpoints follow the same shape: the socket is split, a spawned
//! writer task drains a per-connection `mpsc` queue into the sink, and the
//! handler itself reads client frames until close. The queue's sender is
//! what the channel manager holds, so dropping it from the manager ends the
//! writer and closes the socket.

use crate::channel::CONNECTION_QUEUE_CAPACITY;
use crate::error::ApiResult;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use markscan_common::events::{BatchEvent, ClientMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

/// GET /ws/batch/{batch_id} — batch-scoped progress stream
pub async fn batch_socket(
    ws: WebSocketUpgrade,
    Path(batch_id): Path<Uuid>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    // Reject unknown batches before the upgrade
    state.checkpoints.load_summary(batch_id)?;
    Ok(ws.on_upgrade(move |socket| handle_batch_socket(socket, state, batch_id)))
}

async fn handle_batch_socket(socket: WebSocket, state: AppState, batch_id: Uuid) {
    let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);
    let watcher_id = state.channels.connect(batch_id, tx.clone()).await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx);

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                    let _ = tx.try_send(BatchEvent::Pong {
                        timestamp: Utc::now(),
                    });
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.channels.disconnect_watcher(batch_id, watcher_id).await;
    writer.abort();
}

/// GET /ws/client/{subscriber_id} — client-scoped stream across batches
pub async fn client_socket(
    ws: WebSocketUpgrade,
    Path(subscriber_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_client_socket(socket, state, subscriber_id))
}

async fn handle_client_socket(socket: WebSocket, state: AppState, subscriber_id: String) {
    let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_CAPACITY);

    // Reinstate subscriptions preserved from a pruned connection, then
    // register this connection (replacing any prior one for this id)
    let recovered = state.channels.recover(&subscriber_id).await;
    state
        .channels
        .connect_subscriber(&subscriber_id, tx.clone())
        .await;

    let (sink, mut stream) = socket.split();
    let writer = spawn_writer(sink, rx);

    let _ = tx.try_send(BatchEvent::Connected {
        subscriber_id: subscriber_id.clone(),
        recovered_batches: recovered,
        timestamp: Utc::now(),
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                if let Ok(ClientMessage::Ping) = serde_json::from_str(&text) {
                    state.channels.mark_alive(&subscriber_id).await;
                    let _ = tx.try_send(BatchEvent::Pong {
                        timestamp: Utc::now(),
                    });
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    state
        .channels
        .disconnect_subscriber_conn(&subscriber_id, &tx)
        .await;
    writer.abort();
}

/// Drain the connection queue into the socket until either side closes
fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<BatchEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    })
}
