//! Live channel manager
//!
//! Tracks two kinds of WebSocket peers: batch-scoped watchers (any number
//! per batch, fan-out only) and subscribers (one connection per subscriber
//! id, spanning every batch that subscriber registered). Connections are
//! held as `mpsc` senders; the socket handler owns the actual sink and a
//! writer task drains the channel, so a dead or slow peer never blocks
//! delivery to the others.
//!
//! A subscriber that goes silent past the heartbeat timeout is pruned, but
//! its batch subscriptions survive in a recovery record for a bounded
//! window so a reconnect under the same id resumes watching the same
//! batches.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use markscan_common::events::BatchEvent;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Capacity of each per-connection event queue
pub const CONNECTION_QUEUE_CAPACITY: usize = 256;

/// One batch-scoped watcher connection
struct Watcher {
    id: Uuid,
    tx: mpsc::Sender<BatchEvent>,
}

/// The single live connection for a subscriber id
struct SubscriberConnection {
    tx: mpsc::Sender<BatchEvent>,
    last_seen: DateTime<Utc>,
}

/// Preserved subscription set for a pruned subscriber
#[derive(Debug, Clone)]
pub struct RecoveryRecord {
    pub batches: Vec<Uuid>,
    pub disconnected_at: DateTime<Utc>,
}

/// Connection registry for the live update channel
#[derive(Default)]
pub struct ChannelManager {
    watchers: RwLock<HashMap<Uuid, Vec<Watcher>>>,
    subscribers: RwLock<HashMap<String, SubscriberConnection>>,
    subscriber_batches: RwLock<HashMap<String, Vec<Uuid>>>,
    recovery: RwLock<HashMap<String, RecoveryRecord>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch-scoped watcher; returns its handle id for disconnect
    pub async fn connect(&self, batch_id: Uuid, tx: mpsc::Sender<BatchEvent>) -> Uuid {
        let watcher = Watcher {
            id: Uuid::new_v4(),
            tx,
        };
        let watcher_id = watcher.id;
        let mut watchers = self.watchers.write().await;
        let list = watchers.entry(batch_id).or_default();
        list.push(watcher);
        tracing::info!(
            batch_id = %batch_id,
            connections = list.len(),
            "Watcher connected"
        );
        watcher_id
    }

    pub async fn disconnect_watcher(&self, batch_id: Uuid, watcher_id: Uuid) {
        let mut watchers = self.watchers.write().await;
        if let Some(list) = watchers.get_mut(&batch_id) {
            list.retain(|w| w.id != watcher_id);
            if list.is_empty() {
                watchers.remove(&batch_id);
            }
        }
    }

    /// Send an event to every watcher of a batch.
    ///
    /// Per-connection failures (closed or full queue) are swallowed so one
    /// dead peer never blocks delivery to the rest.
    pub async fn broadcast(&self, batch_id: Uuid, event: BatchEvent) {
        let watchers = self.watchers.read().await;
        let Some(list) = watchers.get(&batch_id) else {
            return;
        };
        for watcher in list {
            if let Err(e) = watcher.tx.try_send(event.clone()) {
                tracing::debug!(
                    batch_id = %batch_id,
                    event = event.event_type(),
                    error = %e,
                    "Dropping event for unreachable watcher"
                );
            }
        }
    }

    /// Register the connection for a subscriber id, replacing any prior one
    pub async fn connect_subscriber(&self, subscriber_id: &str, tx: mpsc::Sender<BatchEvent>) {
        self.subscribers.write().await.insert(
            subscriber_id.to_string(),
            SubscriberConnection {
                tx,
                last_seen: Utc::now(),
            },
        );
        self.subscriber_batches
            .write()
            .await
            .entry(subscriber_id.to_string())
            .or_default();
        tracing::info!(subscriber_id, "Subscriber connected");
    }

    /// Drop a subscriber's connection and subscription set (clean close)
    pub async fn disconnect_subscriber(&self, subscriber_id: &str) {
        self.subscribers.write().await.remove(subscriber_id);
        self.subscriber_batches.write().await.remove(subscriber_id);
        tracing::info!(subscriber_id, "Subscriber disconnected");
    }

    /// Clean close from a socket handler. Only tears the subscriber down if
    /// `tx` is still the registered connection, so a stale socket closing
    /// late cannot evict the connection that replaced it.
    pub async fn disconnect_subscriber_conn(
        &self,
        subscriber_id: &str,
        tx: &mpsc::Sender<BatchEvent>,
    ) {
        let current = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .get(subscriber_id)
                .map(|conn| conn.tx.same_channel(tx))
                .unwrap_or(false)
        };
        if current {
            self.disconnect_subscriber(subscriber_id).await;
        }
    }

    /// Link a subscriber to a batch for client-directed delivery
    pub async fn associate(&self, subscriber_id: &str, batch_id: Uuid) {
        let mut map = self.subscriber_batches.write().await;
        let batches = map.entry(subscriber_id.to_string()).or_default();
        if !batches.contains(&batch_id) {
            batches.push(batch_id);
        }
    }

    /// Which subscriber, if any, registered this batch
    pub async fn subscriber_for_batch(&self, batch_id: Uuid) -> Option<String> {
        let map = self.subscriber_batches.read().await;
        map.iter()
            .find(|(_, batches)| batches.contains(&batch_id))
            .map(|(subscriber_id, _)| subscriber_id.clone())
    }

    pub async fn send_to_subscriber(&self, subscriber_id: &str, event: BatchEvent) {
        let subscribers = self.subscribers.read().await;
        let Some(connection) = subscribers.get(subscriber_id) else {
            return;
        };
        if let Err(e) = connection.tx.try_send(event) {
            tracing::debug!(subscriber_id, error = %e, "Dropping event for unreachable subscriber");
        }
    }

    /// Deliver to the subscriber that owns this batch, if connected
    pub async fn send_to_batch_subscriber(&self, batch_id: Uuid, event: BatchEvent) {
        if let Some(subscriber_id) = self.subscriber_for_batch(batch_id).await {
            self.send_to_subscriber(&subscriber_id, event).await;
        }
    }

    /// Heartbeat refresh
    pub async fn mark_alive(&self, subscriber_id: &str) {
        if let Some(connection) = self.subscribers.write().await.get_mut(subscriber_id) {
            connection.last_seen = Utc::now();
        }
    }

    /// Close connections silent for longer than `timeout_secs`.
    ///
    /// Each pruned subscriber's subscription set is snapshotted into a
    /// recovery record so a reconnect within the recovery window resumes
    /// the same batches. Returns the pruned subscriber ids.
    pub async fn prune_stale(&self, timeout_secs: u64) -> Vec<String> {
        let cutoff = Utc::now() - ChronoDuration::seconds(timeout_secs as i64);

        // Collected and removed under the same write lock, so a heartbeat
        // cannot land between the check and the removal
        let mut subscribers = self.subscribers.write().await;
        let stale: Vec<String> = subscribers
            .iter()
            .filter(|(_, conn)| conn.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        if stale.is_empty() {
            return stale;
        }

        let mut subscriber_batches = self.subscriber_batches.write().await;
        let mut recovery = self.recovery.write().await;
        for subscriber_id in &stale {
            // Dropping the sender closes the socket's writer task
            subscribers.remove(subscriber_id);
            let batches = subscriber_batches.remove(subscriber_id).unwrap_or_default();
            recovery.insert(
                subscriber_id.clone(),
                RecoveryRecord {
                    batches,
                    disconnected_at: Utc::now(),
                },
            );
            tracing::info!(subscriber_id, "Pruned stale subscriber connection");
        }
        stale
    }

    /// Reinstate a pruned subscriber's batch subscriptions on reconnect.
    ///
    /// Returns the recovered batch ids (empty when no record exists) and
    /// consumes the recovery record.
    pub async fn recover(&self, subscriber_id: &str) -> Vec<Uuid> {
        let record = self.recovery.write().await.remove(subscriber_id);
        let Some(record) = record else {
            return Vec::new();
        };
        let mut map = self.subscriber_batches.write().await;
        let batches = map.entry(subscriber_id.to_string()).or_default();
        for batch_id in &record.batches {
            if !batches.contains(batch_id) {
                batches.push(*batch_id);
            }
        }
        tracing::info!(
            subscriber_id,
            recovered = record.batches.len(),
            "Recovered subscriber batch subscriptions"
        );
        record.batches
    }

    /// Drop recovery records older than `max_age_hours`
    pub async fn cleanup_expired_recovery(&self, max_age_hours: u64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(max_age_hours as i64);
        let mut recovery = self.recovery.write().await;
        let before = recovery.len();
        recovery.retain(|_, record| record.disconnected_at >= cutoff);
        before - recovery.len()
    }

    #[cfg(test)]
    async fn backdate_last_seen(&self, subscriber_id: &str, secs: i64) {
        if let Some(connection) = self.subscribers.write().await.get_mut(subscriber_id) {
            connection.last_seen = Utc::now() - ChronoDuration::seconds(secs);
        }
    }

    #[cfg(test)]
    async fn backdate_recovery(&self, subscriber_id: &str, hours: i64) {
        if let Some(record) = self.recovery.write().await.get_mut(subscriber_id) {
            record.disconnected_at = Utc::now() - ChronoDuration::hours(hours);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn progress(batch_id: Uuid, processed: usize) -> BatchEvent {
        BatchEvent::Progress {
            batch_id,
            processed,
            total: 10,
            valid: processed,
            invalid: 0,
            percentage: processed as f64 * 10.0,
            current_item: format!("item-{}", processed),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_watchers() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        manager.connect(batch_id, tx_a).await;
        manager.connect(batch_id, tx_b).await;

        manager.broadcast(batch_id, progress(batch_id, 1)).await;

        assert_eq!(rx_a.recv().await.unwrap().event_type(), "progress");
        assert_eq!(rx_b.recv().await.unwrap().event_type(), "progress");
    }

    #[tokio::test]
    async fn test_dead_watcher_does_not_block_others() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx_dead, rx_dead) = mpsc::channel(8);
        let (tx_live, mut rx_live) = mpsc::channel(8);
        manager.connect(batch_id, tx_dead).await;
        manager.connect(batch_id, tx_live).await;
        drop(rx_dead);

        manager.broadcast(batch_id, progress(batch_id, 1)).await;
        manager.broadcast(batch_id, progress(batch_id, 2)).await;

        assert!(rx_live.recv().await.is_some());
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_watcher_removes_only_that_handle() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let id_a = manager.connect(batch_id, tx_a).await;
        manager.connect(batch_id, tx_b).await;

        manager.disconnect_watcher(batch_id, id_a).await;
        manager.broadcast(batch_id, progress(batch_id, 1)).await;

        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_associate_and_batch_owner_lookup() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx).await;
        manager.associate("client-1", batch_id).await;

        assert_eq!(
            manager.subscriber_for_batch(batch_id).await.as_deref(),
            Some("client-1")
        );

        manager
            .send_to_batch_subscriber(batch_id, progress(batch_id, 1))
            .await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let manager = ChannelManager::new();
        let (tx_old, mut rx_old) = mpsc::channel(8);
        let (tx_new, mut rx_new) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx_old).await;
        manager.connect_subscriber("client-1", tx_new).await;

        manager
            .send_to_subscriber(
                "client-1",
                BatchEvent::Pong {
                    timestamp: Utc::now(),
                },
            )
            .await;

        assert!(rx_new.recv().await.is_some());
        assert!(rx_old.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_socket_close_does_not_evict_replacement() {
        let manager = ChannelManager::new();
        let (tx_old, _rx_old) = mpsc::channel(8);
        let (tx_new, mut rx_new) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx_old.clone()).await;
        manager.connect_subscriber("client-1", tx_new).await;

        // The replaced socket closes late
        manager.disconnect_subscriber_conn("client-1", &tx_old).await;

        manager
            .send_to_subscriber(
                "client-1",
                BatchEvent::Pong {
                    timestamp: Utc::now(),
                },
            )
            .await;
        assert!(rx_new.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_prune_stale_creates_recovery_record() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx).await;
        manager.associate("client-1", batch_id).await;
        manager.backdate_last_seen("client-1", 120).await;

        let pruned = manager.prune_stale(90).await;
        assert_eq!(pruned, vec!["client-1".to_string()]);
        assert!(manager.subscriber_for_batch(batch_id).await.is_none());

        // Reconnect within the window recovers the subscription set
        let recovered = manager.recover("client-1").await;
        assert_eq!(recovered, vec![batch_id]);
        assert_eq!(
            manager.subscriber_for_batch(batch_id).await.as_deref(),
            Some("client-1")
        );

        // The record is consumed by recovery
        assert!(manager.recover("client-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_after_silence_prevents_prune() {
        let manager = ChannelManager::new();
        let batch_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx).await;
        manager.associate("client-1", batch_id).await;
        manager.backdate_last_seen("client-1", 600).await;

        // A late heartbeat revives the connection before the pruner runs
        manager.mark_alive("client-1").await;

        assert!(manager.prune_stale(90).await.is_empty());
        manager
            .send_to_subscriber(
                "client-1",
                BatchEvent::Pong {
                    timestamp: Utc::now(),
                },
            )
            .await;
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_fresh_connection_not_pruned() {
        let manager = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx).await;
        manager.mark_alive("client-1").await;

        assert!(manager.prune_stale(90).await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_expired_recovery_records() {
        let manager = ChannelManager::new();
        let (tx, _rx) = mpsc::channel(8);
        manager.connect_subscriber("client-1", tx).await;
        manager.associate("client-1", Uuid::new_v4()).await;
        manager.backdate_last_seen("client-1", 600).await;
        manager.prune_stale(90).await;
        manager.backdate_recovery("client-1", 48).await;

        assert_eq!(manager.cleanup_expired_recovery(24).await, 1);
        assert!(manager.recover("client-1").await.is_empty());
    }
}
