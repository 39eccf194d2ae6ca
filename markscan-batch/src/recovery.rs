//! Startup recovery
//!
//! Runs once, before the listener binds, so resumed batches cannot race
//! fresh registrations for ledger entries. Every checkpoint record still on
//! disk re-registers its counters at their stored values and its remaining
//! items go back through the dispatcher; staged payload bytes are re-read
//! from disk at dispatch time, the same path a fresh batch takes.

use crate::AppState;
use markscan_common::Result;

/// Resume every incomplete batch found on disk; returns how many
pub async fn resume_pending(state: &AppState) -> Result<usize> {
    let records = state.checkpoints.load_all()?;
    let mut resumed = 0;

    for record in records {
        // Registered but items never arrived; nothing to resume. The idle
        // expiry and the pending sweep bound how long the leftovers live.
        if record.remaining.is_empty() && record.processed < record.total {
            tracing::warn!(
                batch_id = %record.batch_id,
                total = record.total,
                "Skipping checkpoint with no submitted items"
            );
            continue;
        }

        state
            .ledger
            .register_resumed(
                record.batch_id,
                record.total,
                record.processed,
                record.valid,
                record.invalid,
            )
            .await;
        if let Some(subscriber_id) = &record.subscriber_id {
            state.channels.associate(subscriber_id, record.batch_id).await;
        }

        tracing::info!(
            batch_id = %record.batch_id,
            processed = record.processed,
            total = record.total,
            remaining = record.remaining.len(),
            "Resuming batch from checkpoint"
        );

        let dispatcher = state.dispatcher();
        let batch_id = record.batch_id;
        let chunk_size = record.chunk_size;
        let remaining = record.remaining;
        tokio::spawn(async move { dispatcher.run(batch_id, chunk_size, remaining).await });
        resumed += 1;
    }

    Ok(resumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointRecord;
    use crate::detector::{ClassifyRequest, Classifier, Outcome, Verdict, WorkItem};
    use markscan_common::config::Config;
    use markscan_common::events::BatchEvent;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct AlwaysValid;

    #[async_trait::async_trait]
    impl Classifier for AlwaysValid {
        async fn classify(&self, _request: &ClassifyRequest, _attempts: u32) -> Outcome {
            Outcome::Verdict(Verdict {
                valid: true,
                confidence: Some(0.9),
                detector: None,
                region: None,
                error: None,
            })
        }
    }

    fn state(dir: &TempDir) -> AppState {
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        AppState::new(config, Arc::new(AlwaysValid)).unwrap()
    }

    fn references(count: usize) -> Vec<WorkItem> {
        (0..count)
            .map(|i| WorkItem::Reference {
                url: format!("https://example.com/{}.jpg", i),
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_batch_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let batch_id = Uuid::new_v4();

        // A batch that crashed at 3 of 10
        state.checkpoints.create_summary(batch_id, 10).unwrap();
        state
            .checkpoints
            .save_initial(&CheckpointRecord {
                batch_id,
                subscriber_id: None,
                chunk_size: 4,
                total: 10,
                processed: 3,
                valid: 2,
                invalid: 1,
                remaining: references(7),
            })
            .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        state.channels.connect(batch_id, tx).await;

        assert_eq!(resume_pending(&state).await.unwrap(), 1);

        // Drive the spawned dispatcher to its terminal event; the final
        // counts are only reachable from the checkpointed 2/1 starting point
        let complete = tokio::time::timeout(Duration::from_secs(120), async {
            loop {
                match rx.recv().await {
                    Some(BatchEvent::Complete {
                        processed,
                        valid,
                        invalid,
                        ..
                    }) => break (processed, valid, invalid),
                    Some(_) => continue,
                    None => panic!("channel closed before completion"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(complete, (10, 9, 1));
        assert!(state.checkpoints.load(batch_id).unwrap().is_none());
        assert!(state.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_unsubmitted_registration_is_not_resumed() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        let batch_id = Uuid::new_v4();

        state.checkpoints.create_summary(batch_id, 5).unwrap();
        state
            .checkpoints
            .save_initial(&CheckpointRecord {
                batch_id,
                subscriber_id: None,
                chunk_size: 10,
                total: 5,
                processed: 0,
                valid: 0,
                invalid: 0,
                remaining: Vec::new(),
            })
            .unwrap();

        assert_eq!(resume_pending(&state).await.unwrap(), 0);
        assert!(state.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_clean_disk_resumes_nothing() {
        let dir = TempDir::new().unwrap();
        let state = state(&dir);
        assert_eq!(resume_pending(&state).await.unwrap(), 0);
    }
}
