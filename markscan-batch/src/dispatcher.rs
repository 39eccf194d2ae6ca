//! Batch dispatcher
//!
//! Drives a registered batch from its first item to the terminal event.
//! Items are released in chunks with a pacing delay between chunks; inside
//! a chunk items run concurrently, but every classification call in the
//! process first takes a permit from one global semaphore, so the detector
//! never sees more in-flight requests than the host can reasonably feed.
//!
//! Timeouts are the one retryable failure: timed-out items skip the
//! counters on the primary pass and get exactly one more sequential pass
//! at the end. Whatever the retry yields, the item is recorded then, so
//! every item is counted exactly once and the batch always terminates.

use crate::channel::ChannelManager;
use crate::checkpoint::CheckpointStore;
use crate::detector::{ClassifyRequest, Classifier, FailureKind, ItemResult, Outcome, WorkItem};
use crate::ledger::ProgressLedger;
use chrono::Utc;
use markscan_common::events::{percentage, BatchEvent};
use markscan_common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Attempts per item on the primary pass
const PRIMARY_ATTEMPTS: u32 = 3;
/// Attempts per item on the retry pass
const RETRY_ATTEMPTS: u32 = 2;

/// Global in-flight classification cap, derived from the host's cores
pub fn dispatch_parallelism() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cores.saturating_sub(2).clamp(2, 4)
}

/// Pacing delay inserted before chunk `chunk_index` (the first chunk
/// starts immediately)
fn chunk_delay(chunk_index: usize) -> Duration {
    Duration::from_millis(3_000 + 200 * chunk_index as u64)
}

/// Per-batch orchestrator; cheap to clone, one `run` per batch
#[derive(Clone)]
pub struct Dispatcher {
    ledger: Arc<ProgressLedger>,
    checkpoints: Arc<CheckpointStore>,
    channels: Arc<ChannelManager>,
    classifier: Arc<dyn Classifier>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<ProgressLedger>,
        checkpoints: Arc<CheckpointStore>,
        channels: Arc<ChannelManager>,
        classifier: Arc<dyn Classifier>,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            ledger,
            checkpoints,
            channels,
            classifier,
            permits,
        }
    }

    /// Process a batch to completion. Orchestration failures are reported
    /// as an `error` event; per-item failures never surface here.
    pub async fn run(&self, batch_id: Uuid, chunk_size: usize, items: Vec<WorkItem>) {
        if let Err(e) = self.run_inner(batch_id, chunk_size, items).await {
            tracing::error!(batch_id = %batch_id, error = %e, "Batch dispatch failed");
            self.emit(
                batch_id,
                BatchEvent::Error {
                    batch_id,
                    error: e.to_string(),
                    timestamp: Utc::now(),
                },
            )
            .await;
        }
    }

    async fn run_inner(&self, batch_id: Uuid, chunk_size: usize, items: Vec<WorkItem>) -> Result<()> {
        self.checkpoints.mark_processing(batch_id)?;
        let chunk_size = chunk_size.max(1);
        tracing::info!(
            batch_id = %batch_id,
            items = items.len(),
            chunk_size,
            "Dispatching batch"
        );

        // Chunks never overlap: each chunk fans out, fans back in, and only
        // then does the pacing delay run and the next chunk start
        let mut retries = Vec::new();
        for (idx, chunk) in items.chunks(chunk_size).enumerate() {
            if idx > 0 {
                tokio::time::sleep(chunk_delay(idx)).await;
            }

            let mut handles = Vec::with_capacity(chunk.len());
            for item in chunk {
                let dispatcher = self.clone();
                let item = item.clone();
                handles.push(tokio::spawn(async move {
                    dispatcher.process_item(batch_id, item).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(Some(item)) => retries.push(item),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(batch_id = %batch_id, error = %e, "Item task panicked");
                    }
                }
            }
        }

        if !retries.is_empty() {
            self.run_retry_pass(batch_id, retries).await?;
        }
        self.maybe_finish(batch_id).await;
        Ok(())
    }

    /// Classify one item on the primary pass.
    ///
    /// Returns the item back when it timed out and belongs in the retry
    /// set; every other outcome is recorded as final here.
    async fn process_item(&self, batch_id: Uuid, item: WorkItem) -> Option<WorkItem> {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore only closes on shutdown
            Err(_) => return None,
        };

        let request = match self.build_request(batch_id, &item) {
            Ok(request) => request,
            Err(e) => {
                let result = ItemResult::failed(item.label(), e.to_string());
                self.finalize_item(batch_id, &item, result, false).await;
                return None;
            }
        };

        match self.classifier.classify(&request, PRIMARY_ATTEMPTS).await {
            Outcome::Verdict(verdict) => {
                let result = ItemResult::from_verdict(item.label(), verdict);
                self.finalize_item(batch_id, &item, result, false).await;
                None
            }
            Outcome::Failure {
                kind: FailureKind::Timeout,
                message,
            } => {
                tracing::warn!(
                    batch_id = %batch_id,
                    item = %item.label(),
                    %message,
                    "Classification timed out, deferred to retry pass"
                );
                Some(item)
            }
            Outcome::Failure { kind, message } => {
                let result = ItemResult::failed(item.label(), format!("{}: {}", kind, message));
                self.finalize_item(batch_id, &item, result, false).await;
                None
            }
        }
    }

    /// One bounded, sequential pass over the items that timed out.
    /// Every item is recorded this time, timeout or not.
    async fn run_retry_pass(&self, batch_id: Uuid, retries: Vec<WorkItem>) -> Result<()> {
        self.ledger.begin_retry_phase(batch_id, retries.len()).await?;
        tracing::info!(batch_id = %batch_id, retry_total = retries.len(), "Starting retry pass");
        self.emit(
            batch_id,
            BatchEvent::RetryStart {
                batch_id,
                retry_total: retries.len(),
                timestamp: Utc::now(),
            },
        )
        .await;

        for item in retries {
            let result = match self.build_request(batch_id, &item) {
                Ok(request) => match self.classifier.classify(&request, RETRY_ATTEMPTS).await {
                    Outcome::Verdict(verdict) => ItemResult::from_verdict(item.label(), verdict),
                    Outcome::Failure { kind, message } => {
                        ItemResult::failed(item.label(), format!("{}: {}", kind, message))
                    }
                },
                Err(e) => ItemResult::failed(item.label(), e.to_string()),
            };
            self.finalize_item(batch_id, &item, result, true).await;
        }
        Ok(())
    }

    fn build_request(&self, batch_id: Uuid, item: &WorkItem) -> Result<ClassifyRequest> {
        match item {
            WorkItem::File { name } => {
                if name.trim().is_empty() {
                    return Err(Error::InvalidInput("empty file name".to_string()));
                }
                let data = self.checkpoints.load_staged(batch_id, name)?;
                Ok(ClassifyRequest::Payload {
                    name: name.clone(),
                    data,
                })
            }
            WorkItem::Reference { url } => {
                if url.trim().is_empty() {
                    return Err(Error::InvalidInput("empty reference".to_string()));
                }
                Ok(ClassifyRequest::Reference { url: url.clone() })
            }
        }
    }

    /// Record a final verdict: results file, checkpoint shrink, counters,
    /// then the progress event built from the counters' snapshot
    async fn finalize_item(&self, batch_id: Uuid, item: &WorkItem, result: ItemResult, retry: bool) {
        let current_item = result.item.clone();
        let is_valid = result.valid;

        if let Err(e) = self.checkpoints.append_result(batch_id, &result) {
            tracing::warn!(batch_id = %batch_id, item = %current_item, error = %e, "Failed to append result record");
        }
        if let Err(e) = self.checkpoints.remove_item(batch_id, item, is_valid) {
            tracing::warn!(batch_id = %batch_id, item = %current_item, error = %e, "Failed to shrink checkpoint");
        }

        let snapshot = if retry {
            self.ledger.record_retry_result(batch_id, is_valid).await
        } else {
            self.ledger.record_result(batch_id, is_valid).await
        };
        match snapshot {
            Ok(snapshot) => {
                self.emit(
                    batch_id,
                    BatchEvent::Progress {
                        batch_id,
                        processed: snapshot.processed,
                        total: snapshot.total,
                        valid: snapshot.valid,
                        invalid: snapshot.invalid,
                        percentage: percentage(snapshot.processed, snapshot.total),
                        current_item,
                        timestamp: Utc::now(),
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::warn!(batch_id = %batch_id, error = %e, "Result recorded for untracked batch");
            }
        }
    }

    /// Emit the terminal event if this batch just became terminal.
    /// The ledger hands the final snapshot to exactly one caller.
    async fn maybe_finish(&self, batch_id: Uuid) {
        let Some(snapshot) = self.ledger.try_mark_done(batch_id).await else {
            return;
        };

        if let Err(e) = self.checkpoints.finalize_summary(
            batch_id,
            snapshot.valid,
            snapshot.invalid,
            snapshot.total,
        ) {
            tracing::warn!(batch_id = %batch_id, error = %e, "Failed to finalize batch summary");
        }

        self.emit(
            batch_id,
            BatchEvent::Complete {
                batch_id,
                processed: snapshot.processed,
                total: snapshot.total,
                valid: snapshot.valid,
                invalid: snapshot.invalid,
                percentage: percentage(snapshot.processed, snapshot.total),
                timestamp: Utc::now(),
            },
        )
        .await;

        if let Err(e) = self.checkpoints.clear(batch_id) {
            tracing::warn!(batch_id = %batch_id, error = %e, "Failed to clear checkpoint");
        }
        self.ledger.release(batch_id).await;
        tracing::info!(
            batch_id = %batch_id,
            valid = snapshot.valid,
            invalid = snapshot.invalid,
            total = snapshot.total,
            "Batch complete"
        );
    }

    /// Deliver to the batch's watchers and to the subscriber that owns it
    async fn emit(&self, batch_id: Uuid, event: BatchEvent) {
        self.channels.broadcast(batch_id, event.clone()).await;
        self.channels.send_to_batch_subscriber(batch_id, event).await;
    }
}
