//! Supervised background tasks
//!
//! Three periodic loops, each under one shared `CancellationToken`:
//! stale-connection pruning, recovery-record cleanup, and the on-disk
//! checkpoint sweep. `shutdown` cancels the token and joins every loop.

use crate::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Seconds between stale-connection scans
const PRUNE_INTERVAL_SECS: u64 = 30;
/// Seconds between recovery-record cleanup passes
const RECOVERY_CLEANUP_INTERVAL_SECS: u64 = 3_600;

pub struct BackgroundTasks {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn spawn(state: &AppState) -> Self {
        let token = CancellationToken::new();
        let handles = vec![
            spawn_pruner(state.clone(), token.clone()),
            spawn_recovery_cleanup(state.clone(), token.clone()),
            spawn_sweeper(state.clone(), token.clone()),
        ];
        Self { token, handles }
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn spawn_pruner(state: AppState, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timeout = state.config.heartbeat_timeout_secs;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(PRUNE_INTERVAL_SECS)) => {
                    let pruned = state.channels.prune_stale(timeout).await;
                    if !pruned.is_empty() {
                        tracing::info!(count = pruned.len(), "Pruned stale subscriber connections");
                    }
                }
            }
        }
    })
}

fn spawn_recovery_cleanup(state: AppState, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let max_age = state.config.recovery_max_age_hours;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(RECOVERY_CLEANUP_INTERVAL_SECS)) => {
                    let dropped = state.channels.cleanup_expired_recovery(max_age).await;
                    if dropped > 0 {
                        tracing::info!(count = dropped, "Dropped expired recovery records");
                    }
                }
            }
        }
    })
}

fn spawn_sweeper(state: AppState, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(state.config.sweep_interval_secs);
        let max_age = state.config.sweep_max_age_hours;
        let pending_max_age = state.config.sweep_pending_max_age_hours;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let swept = state.checkpoints.sweep(max_age, pending_max_age);
                    if swept > 0 {
                        tracing::info!(count = swept, "Swept old batch directories");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{ClassifyRequest, Classifier, Outcome, Verdict};
    use markscan_common::config::Config;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NoopClassifier;

    #[async_trait::async_trait]
    impl Classifier for NoopClassifier {
        async fn classify(&self, _request: &ClassifyRequest, _attempts: u32) -> Outcome {
            Outcome::Verdict(Verdict {
                valid: true,
                confidence: None,
                detector: None,
                region: None,
                error: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_joins_all_loops() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let state = AppState::new(config, Arc::new(NoopClassifier)).unwrap();

        let tasks = BackgroundTasks::spawn(&state);
        // Let each loop run at least one tick
        tokio::time::sleep(Duration::from_secs(7_200)).await;

        tokio::time::timeout(Duration::from_secs(5), tasks.shutdown())
            .await
            .expect("shutdown should join promptly");
    }
}
