//! Progress ledger
//!
//! In-memory, per-batch counters behind one fine-grained lock per batch id.
//! The ledger owns the authoritative answer to "is this batch done": the
//! dispatcher records results here and emits events from the snapshot each
//! update returns, so event order matches counter order for free.
//!
//! Every entry is released either through `release` (after the terminal
//! event) or by its idle-expiry task, so abandoned batches cannot leak.

use markscan_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Counters for one batch; snapshots of this are what events are built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub processed: usize,
    pub valid: usize,
    pub invalid: usize,
    pub done: bool,
    pub complete_sent: bool,
    pub retry_phase: bool,
    pub retry_total: usize,
    pub retry_processed: usize,
}

impl BatchProgress {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            valid: 0,
            invalid: 0,
            done: false,
            complete_sent: false,
            retry_phase: false,
            retry_total: 0,
            retry_processed: 0,
        }
    }

    /// Primary pass finished and, if a retry phase ran, that finished too
    pub fn is_terminal(&self) -> bool {
        self.processed >= self.total
            && (!self.retry_phase || self.retry_processed >= self.retry_total)
    }
}

/// Per-batch progress counters keyed by batch id
pub struct ProgressLedger {
    batches: RwLock<HashMap<Uuid, Arc<Mutex<BatchProgress>>>>,
    expiry_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    idle_expiry: Duration,
}

impl ProgressLedger {
    pub fn new(idle_expiry: Duration) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            expiry_tokens: RwLock::new(HashMap::new()),
            idle_expiry,
        }
    }

    /// Create counters for a new batch and arm its idle-expiry task
    pub async fn register(self: &Arc<Self>, batch_id: Uuid, total: usize) {
        self.insert(batch_id, BatchProgress::new(total)).await;
    }

    /// Re-create counters at their last checkpointed values (crash recovery)
    pub async fn register_resumed(
        self: &Arc<Self>,
        batch_id: Uuid,
        total: usize,
        processed: usize,
        valid: usize,
        invalid: usize,
    ) {
        let mut progress = BatchProgress::new(total);
        progress.processed = processed;
        progress.valid = valid;
        progress.invalid = invalid;
        self.insert(batch_id, progress).await;
    }

    async fn insert(self: &Arc<Self>, batch_id: Uuid, progress: BatchProgress) {
        self.batches
            .write()
            .await
            .insert(batch_id, Arc::new(Mutex::new(progress)));

        // Idle-expiry guard against batches nobody ever completes
        let token = CancellationToken::new();
        if let Some(previous) = self
            .expiry_tokens
            .write()
            .await
            .insert(batch_id, token.clone())
        {
            previous.cancel();
        }

        let ledger = Arc::clone(self);
        let idle_expiry = self.idle_expiry;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(idle_expiry) => {
                    let expired = {
                        match ledger.entry(batch_id).await {
                            Some(entry) => !entry.lock().await.done,
                            None => false,
                        }
                    };
                    if expired {
                        tracing::warn!(batch_id = %batch_id, "Idle batch expired, releasing ledger entry");
                        ledger.release(batch_id).await;
                    }
                }
            }
        });
    }

    async fn entry(&self, batch_id: Uuid) -> Option<Arc<Mutex<BatchProgress>>> {
        self.batches.read().await.get(&batch_id).cloned()
    }

    async fn require(&self, batch_id: Uuid) -> Result<Arc<Mutex<BatchProgress>>> {
        self.entry(batch_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("batch not tracked: {}", batch_id)))
    }

    /// Record one primary-pass result and return a consistent snapshot
    pub async fn record_result(&self, batch_id: Uuid, is_valid: bool) -> Result<BatchProgress> {
        let entry = self.require(batch_id).await?;
        let mut progress = entry.lock().await;
        progress.processed += 1;
        if is_valid {
            progress.valid += 1;
        } else {
            progress.invalid += 1;
        }
        Ok(*progress)
    }

    /// Arm the retry-phase counter pair
    pub async fn begin_retry_phase(&self, batch_id: Uuid, retry_total: usize) -> Result<()> {
        let entry = self.require(batch_id).await?;
        let mut progress = entry.lock().await;
        progress.retry_phase = true;
        progress.retry_total = retry_total;
        progress.retry_processed = 0;
        Ok(())
    }

    /// Record one retry-pass result; bumps both counter pairs
    pub async fn record_retry_result(
        &self,
        batch_id: Uuid,
        is_valid: bool,
    ) -> Result<BatchProgress> {
        let entry = self.require(batch_id).await?;
        let mut progress = entry.lock().await;
        progress.retry_processed += 1;
        progress.processed += 1;
        if is_valid {
            progress.valid += 1;
        } else {
            progress.invalid += 1;
        }
        Ok(*progress)
    }

    /// Read-only progress view, for the status endpoint
    pub async fn snapshot(&self, batch_id: Uuid) -> Option<BatchProgress> {
        let entry = self.entry(batch_id).await?;
        let progress = entry.lock().await;
        Some(*progress)
    }

    pub async fn is_terminal(&self, batch_id: Uuid) -> bool {
        match self.entry(batch_id).await {
            Some(entry) => entry.lock().await.is_terminal(),
            None => false,
        }
    }

    /// Claim the right to emit the terminal event.
    ///
    /// Returns the final snapshot for exactly one caller even when several
    /// chunk tasks race to detect terminality; everyone else gets `None`.
    pub async fn try_mark_done(&self, batch_id: Uuid) -> Option<BatchProgress> {
        let entry = self.entry(batch_id).await?;
        let mut progress = entry.lock().await;
        if !progress.is_terminal() || progress.complete_sent {
            return None;
        }
        progress.done = true;
        progress.complete_sent = true;
        Some(*progress)
    }

    /// Drop all state for a batch and cancel its idle-expiry task
    pub async fn release(&self, batch_id: Uuid) {
        self.batches.write().await.remove(&batch_id);
        if let Some(token) = self.expiry_tokens.write().await.remove(&batch_id) {
            token.cancel();
        }
    }

    /// Number of batches currently tracked
    pub async fn len(&self) -> usize {
        self.batches.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> Arc<ProgressLedger> {
        Arc::new(ProgressLedger::new(Duration::from_secs(3600)))
    }

    #[tokio::test]
    async fn test_record_result_counter_invariant() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 3).await;

        let s1 = ledger.record_result(batch_id, true).await.unwrap();
        assert_eq!((s1.processed, s1.valid, s1.invalid), (1, 1, 0));

        let s2 = ledger.record_result(batch_id, false).await.unwrap();
        assert_eq!((s2.processed, s2.valid, s2.invalid), (2, 1, 1));

        let s3 = ledger.record_result(batch_id, true).await.unwrap();
        assert!(s3.processed <= s3.total);
        assert_eq!(s3.valid + s3.invalid, s3.processed);
        assert!(s3.is_terminal());
    }

    #[tokio::test]
    async fn test_unknown_batch_is_an_error() {
        let ledger = ledger();
        assert!(ledger.record_result(Uuid::new_v4(), true).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_phase_counters() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 2).await;

        // One item completes, one times out (never recorded in primary pass)
        ledger.record_result(batch_id, true).await.unwrap();
        assert!(!ledger.is_terminal(batch_id).await);

        ledger.begin_retry_phase(batch_id, 1).await.unwrap();
        assert!(!ledger.is_terminal(batch_id).await);

        let snapshot = ledger.record_retry_result(batch_id, false).await.unwrap();
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.retry_processed, 1);
        assert_eq!(snapshot.valid + snapshot.invalid, snapshot.processed);
        assert!(snapshot.is_terminal());
    }

    #[tokio::test]
    async fn test_try_mark_done_exactly_once() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 1).await;
        ledger.record_result(batch_id, true).await.unwrap();

        let first = ledger.try_mark_done(batch_id).await;
        assert!(first.is_some());
        let snapshot = first.unwrap();
        assert!(snapshot.done && snapshot.complete_sent);

        // Racing completion detectors get nothing
        assert!(ledger.try_mark_done(batch_id).await.is_none());
    }

    #[tokio::test]
    async fn test_try_mark_done_requires_terminal() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 2).await;
        ledger.record_result(batch_id, true).await.unwrap();
        assert!(ledger.try_mark_done(batch_id).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_total_immediately_terminal() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 0).await;
        assert!(ledger.is_terminal(batch_id).await);
        assert!(ledger.try_mark_done(batch_id).await.is_some());
    }

    #[tokio::test]
    async fn test_release_drops_state() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 1).await;
        assert_eq!(ledger.len().await, 1);

        ledger.release(batch_id).await;
        assert!(ledger.is_empty().await);
        assert!(ledger.snapshot(batch_id).await.is_none());
    }

    #[tokio::test]
    async fn test_register_resumed_keeps_counters() {
        let ledger = ledger();
        let batch_id = Uuid::new_v4();
        ledger.register_resumed(batch_id, 10, 3, 2, 1).await;

        let snapshot = ledger.snapshot(batch_id).await.unwrap();
        assert_eq!(snapshot.processed, 3);
        assert_eq!(snapshot.valid, 2);
        assert_eq!(snapshot.invalid, 1);
        assert!(!snapshot.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_batch_auto_expires() {
        let ledger = Arc::new(ProgressLedger::new(Duration::from_millis(50)));
        let batch_id = Uuid::new_v4();
        ledger.register(batch_id, 5).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Yield so the expiry task observes the elapsed timer
        tokio::task::yield_now().await;
        assert!(ledger.snapshot(batch_id).await.is_none());
    }

    #[tokio::test]
    async fn test_independent_batches_do_not_interfere() {
        let ledger = ledger();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        ledger.register(a, 1).await;
        ledger.register(b, 1).await;

        ledger.record_result(a, true).await.unwrap();
        assert!(ledger.is_terminal(a).await);
        assert!(!ledger.is_terminal(b).await);

        ledger.release(a).await;
        assert!(ledger.snapshot(b).await.is_some());
    }
}
