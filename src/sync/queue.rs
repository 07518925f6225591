//! Sync queue: propagations that failed at write time, retried in the
//! background until they land or hit the retry cap.

use std::time::{Duration, Instant};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ConnectivityState, SyncQueueItem, SyncResult, QUEUE_COLLECTION};
use super::{ItemOutcome, SyncEngine};
use crate::core::{StorageEvent, WriteAction};
use crate::metrics;
use crate::storage::traits::StorageError;
use crate::storage_item::item_key;

impl SyncEngine {
    /// Queue a propagation, replacing any earlier entry for the same item.
    pub async fn enqueue(&self, entry: SyncQueueItem) {
        debug!(key = %entry.id, action = %entry.action, "Queued propagation");
        if let Err(e) = self.core.put_record(QUEUE_COLLECTION, &entry.id, &entry).await {
            warn!(key = %entry.id, error = %e, "Failed to persist sync queue entry");
        }
    }

    pub(crate) async fn dequeue(&self, key: &str) {
        if let Err(e) = self.core.delete_record(QUEUE_COLLECTION, key).await {
            debug!(key, error = %e, "Failed to drop sync queue entry");
        }
    }

    pub(crate) async fn has_queued_delete(&self, collection: &str, id: &str) -> bool {
        matches!(
            self.core.get_record::<SyncQueueItem>(QUEUE_COLLECTION, &item_key(collection, id)).await,
            Ok(Some(entry)) if entry.action == WriteAction::Delete && !entry.permanently_failed
        )
    }

    /// Every queue entry, permanently failed ones included, in drain order.
    pub async fn queue_items(&self) -> Result<Vec<SyncQueueItem>, StorageError> {
        let mut items: Vec<SyncQueueItem> = self.core.list_records(QUEUE_COLLECTION).await?;
        items.sort_by_key(|e| (e.priority, e.timestamp));
        Ok(items)
    }

    /// Entries still eligible for automatic retry.
    pub async fn queue_len(&self) -> Result<usize, StorageError> {
        Ok(self.queue_items().await?.iter().filter(|e| !e.permanently_failed).count())
    }

    async fn on_storage_event(&self, event: StorageEvent) {
        if let StorageEvent::PropagationFailed { collection, id, action, item, .. } = event {
            self.enqueue(SyncQueueItem::new(&collection, &id, action, item)).await;
        }
    }

    /// Move buffered propagation failures into the queue without waiting.
    /// A no-op while the event listener is running, since it handles them.
    pub(crate) async fn drain_events(&self) -> usize {
        let mut buffered = Vec::new();
        if let Ok(mut rx) = self.events.try_lock() {
            loop {
                match rx.try_recv() {
                    Ok(event) => buffered.push(event),
                    Err(TryRecvError::Lagged(missed)) => {
                        warn!(missed, "Storage events dropped, sweep will pick up pending items");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        let count = buffered.len();
        for event in buffered {
            self.on_storage_event(event).await;
        }
        count
    }

    /// Feed propagation failures into the queue as they happen.
    pub async fn run_event_listener(&self, cancel: CancellationToken) {
        loop {
            let next = {
                let mut rx = self.events.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    event = rx.recv() => Some(event),
                }
            };
            match next {
                None => break,
                Some(Ok(event)) => self.on_storage_event(event).await,
                Some(Err(RecvError::Lagged(missed))) => {
                    warn!(missed, "Storage events dropped, sweep will pick up pending items");
                }
                Some(Err(RecvError::Closed)) => break,
            }
        }
        debug!("Storage event listener stopped");
    }

    async fn apply_queued(&self, entry: &SyncQueueItem) -> Result<ItemOutcome, StorageError> {
        // Same single-pass rule as sweeps and the change feed
        let lock = self.collection_lock(&entry.collection);
        let _guard = lock.lock().await;
        match entry.action {
            WriteAction::Delete => {
                let _item_guard = self.core.lock_item(&entry.collection, &entry.item_id).await;
                // Re-created since; its own propagation supersedes the delete
                if self.core.local_item(&entry.collection, &entry.item_id).await?.is_some() {
                    return Ok(ItemOutcome::Unchanged);
                }
                self.core.remote_delete(&entry.collection, &entry.item_id).await?;
                Ok(ItemOutcome::Pushed)
            }
            WriteAction::Create | WriteAction::Update => {
                match self.core.local_item(&entry.collection, &entry.item_id).await? {
                    Some(local) if local.metadata.sync_status.needs_sync() => self.reconcile_item(local).await,
                    // Already synced by a sweep, deleted since, or parked as a conflict
                    _ => Ok(ItemOutcome::Unchanged),
                }
            }
        }
    }

    /// One drain of the queue. Skipped while the authoritative tier is
    /// known to be unreachable so outages do not burn retries.
    #[tracing::instrument(skip(self))]
    pub async fn process_queue(&self) -> SyncResult {
        self.drain_events().await;
        let started = Instant::now();

        if !self.core.has_remote() || self.connectivity() == ConnectivityState::Offline {
            return SyncResult::skipped();
        }
        if self.core.circuit().is_open() && !self.core.refresh_circuit().await {
            return SyncResult::skipped();
        }

        let entries = match self.queue_items().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Could not read sync queue");
                return SyncResult { errors: 1, ..Default::default() };
            }
        };

        let mut result = SyncResult::default();
        for mut entry in entries.into_iter().filter(|e| !e.permanently_failed) {
            match self.apply_queued(&entry).await {
                Ok(outcome) => {
                    match outcome {
                        ItemOutcome::Conflict { resolved } => {
                            result.conflicts += 1;
                            if !resolved {
                                debug!(key = %entry.id, "Queued item parked as conflict");
                            }
                        }
                        ItemOutcome::Unchanged => {}
                        _ => {
                            result.synced += 1;
                            metrics::record_sync_item("synced");
                        }
                    }
                    self.dequeue(&entry.id).await;
                }
                Err(e) => {
                    entry.retry_count += 1;
                    entry.last_error = Some(e.to_string());
                    result.errors += 1;
                    metrics::record_sync_item("error");
                    if entry.retry_count >= self.config.max_retries {
                        entry.permanently_failed = true;
                        warn!(
                            key = %entry.id,
                            action = %entry.action,
                            retries = entry.retry_count,
                            error = %e,
                            "Queue entry permanently failed"
                        );
                    } else {
                        debug!(key = %entry.id, retries = entry.retry_count, error = %e, "Queue entry will retry");
                    }
                    if let Err(e) = self.core.put_record(QUEUE_COLLECTION, &entry.id, &entry).await {
                        warn!(key = %entry.id, error = %e, "Failed to update sync queue entry");
                    }
                }
            }
        }

        if let Ok(len) = self.queue_len().await {
            metrics::set_sync_queue_len(len);
        }
        result.duration = started.elapsed();
        if result.synced + result.errors + result.conflicts > 0 {
            info!(
                synced = result.synced,
                conflicts = result.conflicts,
                errors = result.errors,
                "Sync queue drained"
            );
        }
        result
    }

    /// Drain the queue on a fixed interval until cancelled.
    pub async fn run_queue_processor(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.queue_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.process_queue().await;
                }
            }
        }
        debug!("Sync queue processor stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::tests::engine_with;
    use super::*;
    use crate::sync::types::ConflictStrategy;

    #[tokio::test]
    async fn test_failed_write_is_queued_and_drained() {
        let (engine, remote) = engine_with(ConflictStrategy::LastWins);
        remote.set_outage(true);
        engine.core().set("orders", "o1", json!({"total": 1})).await.unwrap();

        assert_eq!(engine.drain_events().await, 1);
        let queued = engine.queue_items().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, WriteAction::Create);

        remote.set_outage(false);
        let result = engine.process_queue().await;
        assert_eq!(result.synced, 1);
        assert_eq!(engine.queue_len().await.unwrap(), 0);
        assert!(remote.inner().row("orders", "o1").is_some());
    }

    #[tokio::test]
    async fn test_queued_delete_applied_and_blocks_resurrection() {
        let (engine, remote) = engine_with(ConflictStrategy::LastWins);
        engine.core().set("orders", "o1", json!({"total": 1})).await.unwrap();
        remote.set_outage(true);
        engine.core().delete("orders", "o1").await.unwrap();
        engine.drain_events().await;
        remote.set_outage(false);

        assert!(engine.has_queued_delete("orders", "o1").await);
        // The sweep must not pull the remote row back while the delete is queued
        engine.sync_collection("orders", false).await;
        assert!(engine.core().local_item("orders", "o1").await.unwrap().is_none());

        engine.process_queue().await;
        assert!(remote.inner().row("orders", "o1").is_none());
        assert_eq!(engine.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queued_delete_dropped_after_recreate() {
        let (engine, remote) = engine_with(ConflictStrategy::LastWins);
        engine.core().set("orders", "o1", json!({"total": 1})).await.unwrap();
        remote.set_outage(true);
        engine.core().delete("orders", "o1").await.unwrap();
        engine.drain_events().await;
        remote.set_outage(false);

        engine.core().set("orders", "o1", json!({"total": 2})).await.unwrap();
        engine.process_queue().await;
        assert_eq!(remote.inner().row("orders", "o1").unwrap().data, json!({"total": 2}));
        assert_eq!(engine.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_cap_marks_permanent_failure() {
        let (engine, remote) = engine_with(ConflictStrategy::LastWins);
        remote.set_outage(true);
        engine.core().set("orders", "o1", json!({})).await.unwrap();
        engine.drain_events().await;

        // Fail the remote only for item calls, not for the circuit probe
        remote.set_outage(false);
        remote.fail_collection("orders", true);
        for _ in 0..engine.config().max_retries {
            engine.process_queue().await;
        }

        let entries = engine.queue_items().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].permanently_failed);
        assert!(entries[0].last_error.is_some());
        assert_eq!(engine.queue_len().await.unwrap(), 0);

        // Excluded from further automatic retries
        let result = engine.process_queue().await;
        assert_eq!(result.errors, 0);
    }
}
