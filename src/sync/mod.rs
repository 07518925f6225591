// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine: reconciles the local cache with the authoritative tier.
//!
//! # Reconciliation pass
//!
//! ```text
//! for each local item not yet synced:
//!     remote missing                        → push
//!     checksum differs && updated_at differs → conflict (strategy decides)
//!     same checksum                         → mark synced
//!     otherwise                             → pull
//! then pull remote rows updated in the recent window that are missing locally
//! ```
//!
//! Only one pass runs per collection at a time. A second call either returns
//! a skipped result or, with `force`, waits for the running one.
//!
//! # Scheduling
//!
//! | Mode       | Drivers                                                        |
//! |------------|----------------------------------------------------------------|
//! | `realtime` | change feed + queue drain                                      |
//! | `batch`    | full sweep every `batch_interval_secs` + queue drain           |
//! | `manual`   | none; call [`SyncEngine::perform_full_sync`]                   |
//! | `adaptive` | realtime, paused by the connectivity monitor while unreachable |

pub mod conflict;
mod connectivity;
mod queue;
mod realtime;
pub mod types;

pub use realtime::ChangeOutcome;
pub use types::{
    ConflictResolution, ConflictStrategy, ConnectivityState, FullSyncReport, ManualResolution,
    ResolutionStrategy, SyncError, SyncMode, SyncQueueItem, SyncResult, CONFLICT_COLLECTION,
    QUEUE_COLLECTION,
};

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::core::{StorageCore, StorageEvent};
use crate::metrics;
use crate::storage::traits::{RowFilter, StorageError};
use crate::storage_item::{is_internal_collection, now_millis, StorageItem, SyncStatus, TierSource};

/// What reconciling one item did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Pushed,
    Pulled,
    /// Remote already had the same content
    Confirmed,
    /// Conflict recorded; `resolved` when the strategy wrote a winner
    Conflict { resolved: bool },
    /// Nothing to do (already synced, gone, or waiting on an operator)
    Unchanged,
}

pub struct SyncEngine {
    core: Arc<StorageCore>,
    config: SyncConfig,
    /// Per-collection pass guard
    in_progress: DashMap<String, Arc<Mutex<()>>>,
    /// Propagation failures from the core, subscribed at construction
    events: Mutex<broadcast::Receiver<StorageEvent>>,
    connectivity: watch::Sender<ConnectivityState>,
    failed_samples: AtomicU32,
}

impl SyncEngine {
    pub fn new(core: Arc<StorageCore>, config: SyncConfig) -> Self {
        let events = Mutex::new(core.subscribe());
        let (connectivity, _) = watch::channel(ConnectivityState::Online);
        Self {
            core,
            config,
            in_progress: DashMap::new(),
            events,
            connectivity,
            failed_samples: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<StorageCore> {
        &self.core
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether changes to `collection` are reconciled.
    pub(crate) fn tracks(&self, collection: &str) -> bool {
        !is_internal_collection(collection)
            && (self.config.collections.is_empty() || self.config.collections.iter().any(|c| c == collection))
    }

    /// Collections covered by a full sync.
    pub async fn collections(&self) -> Result<Vec<String>, StorageError> {
        if !self.config.collections.is_empty() {
            return Ok(self.config.collections.clone());
        }
        self.core.collections().await
    }

    fn collection_lock(&self, collection: &str) -> Arc<Mutex<()>> {
        self.in_progress.entry(collection.to_string()).or_default().clone()
    }

    /// Reconcile one collection.
    #[tracing::instrument(skip(self))]
    pub async fn sync_collection(&self, collection: &str, force: bool) -> SyncResult {
        let lock = self.collection_lock(collection);
        let _guard = if force {
            lock.lock().await
        } else {
            match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(collection, "Sync already running for collection, skipping");
                    return SyncResult::skipped();
                }
            }
        };

        let started = Instant::now();
        let mut result = SyncResult::default();

        let pending = match self.core.pending_items(collection).await {
            Ok(items) => items,
            Err(e) => {
                warn!(collection, error = %e, "Could not list pending items");
                result.errors += 1;
                result.duration = started.elapsed();
                return result;
            }
        };

        for item in pending {
            let key = item.key();
            match self.reconcile_item(item).await {
                Ok(outcome) => {
                    match outcome {
                        ItemOutcome::Pushed | ItemOutcome::Pulled | ItemOutcome::Confirmed => {
                            result.synced += 1;
                            metrics::record_sync_item("synced");
                        }
                        ItemOutcome::Conflict { .. } => result.conflicts += 1,
                        ItemOutcome::Unchanged => {}
                    }
                    self.dequeue(&key).await;
                }
                Err(e) => {
                    debug!(collection, key = %key, error = %e, "Item not reconciled");
                    result.errors += 1;
                    metrics::record_sync_item("error");
                }
            }
        }

        if self.core.has_remote() {
            match self.pull_recent(collection).await {
                Ok(pulled) => result.synced += pulled,
                Err(e) => {
                    warn!(collection, error = %e, "Pulling recent remote rows failed");
                    result.errors += 1;
                }
            }
        }

        if result.errors == 0 {
            if let Err(e) = self.core.set_last_sync(collection, now_millis()).await {
                warn!(collection, error = %e, "Failed to record last sync time");
            }
        }

        result.duration = started.elapsed();
        metrics::record_sync_duration(result.duration);
        info!(
            collection,
            synced = result.synced,
            conflicts = result.conflicts,
            errors = result.errors,
            duration_ms = result.duration.as_millis() as u64,
            "Collection sync finished"
        );
        result
    }

    /// Reconcile every collection, then drain what the sweep left in the
    /// queue. Pending items are counted under their collection.
    #[tracing::instrument(skip(self))]
    pub async fn perform_full_sync(&self) -> FullSyncReport {
        let started = Instant::now();
        if self.core.has_remote() {
            self.core.refresh_circuit().await;
        }
        self.drain_events().await;

        let mut report = FullSyncReport::default();
        let collections = match self.collections().await {
            Ok(collections) => collections,
            Err(e) => {
                warn!(error = %e, "Could not list collections for full sync");
                Vec::new()
            }
        };
        for collection in collections {
            let result = self.sync_collection(&collection, true).await;
            report.collections.insert(collection, result);
        }
        let queue = self.process_queue().await;
        if !queue.skipped {
            report.queue = queue;
        }
        report.duration = started.elapsed();
        self.refresh_conflict_gauge().await;
        info!(
            collections = report.collections.len(),
            synced = report.synced(),
            conflicts = report.conflicts(),
            errors = report.errors(),
            "Full sync finished"
        );
        report
    }

    pub(crate) async fn reconcile_item(&self, local: StorageItem) -> Result<ItemOutcome, StorageError> {
        let _item_guard = self.core.lock_item(&local.collection, &local.id).await;
        // The caller's copy may predate a write that finished while we waited
        let Some(local) = self
            .core
            .local_item(&local.collection, &local.id)
            .await?
            .filter(|current| current.metadata.sync_status.needs_sync())
        else {
            return Ok(ItemOutcome::Unchanged);
        };
        let expected = Some(local.metadata.updated_at);
        let Some(remote) = self.core.remote_get(&local.collection, &local.id).await? else {
            self.push(&local, expected).await?;
            return Ok(ItemOutcome::Pushed);
        };

        if !remote.checksum_matches() {
            metrics::record_corruption(&local.collection);
            return Err(StorageError::Corruption {
                id: remote.key(),
                expected: remote.metadata.checksum.clone(),
                actual: crate::storage_item::checksum(&remote.data),
            });
        }

        if conflict::is_conflict(&local, &remote) {
            let resolved = self.handle_conflict(local, remote).await?;
            return Ok(ItemOutcome::Conflict { resolved });
        }

        if local.metadata.checksum == remote.metadata.checksum {
            let synced = local.with_status(SyncStatus::Synced, TierSource::Authoritative);
            self.core.replace_local(&synced, expected).await?;
            Ok(ItemOutcome::Confirmed)
        } else if local.is_newer_than(&remote) {
            self.push(&local, expected).await?;
            Ok(ItemOutcome::Pushed)
        } else {
            self.core.replace_local(&remote, expected).await?;
            Ok(ItemOutcome::Pulled)
        }
    }

    async fn push(&self, item: &StorageItem, expected: Option<i64>) -> Result<(), StorageError> {
        self.core.remote_upsert(item).await?;
        let synced = item.clone().with_status(SyncStatus::Synced, TierSource::Authoritative);
        if !self.core.replace_local(&synced, expected).await? {
            debug!(key = %item.key(), "Local copy changed during push, leaving it pending");
        }
        Ok(())
    }

    /// Pull remote rows from the recent window (or since the last clean
    /// sync, if older) that have no local counterpart.
    async fn pull_recent(&self, collection: &str) -> Result<usize, StorageError> {
        let window_start = now_millis() - (self.config.recent_window_secs as i64) * 1000;
        let since = match self.core.last_sync(collection).await? {
            Some(last) => last.min(window_start),
            None => window_start,
        };
        let rows = self.core.remote_select(collection, RowFilter::UpdatedSince(since)).await?;

        let mut pulled = 0;
        for remote in rows {
            if self.core.local_item(collection, &remote.id).await?.is_some() {
                continue;
            }
            if self.has_queued_delete(collection, &remote.id).await {
                continue;
            }
            if !remote.checksum_matches() {
                warn!(collection, id = %remote.id, "Skipping remote row with bad checksum");
                metrics::record_corruption(collection);
                continue;
            }
            if self.core.replace_local(&remote, None).await? {
                pulled += 1;
            }
        }
        if pulled > 0 {
            debug!(collection, pulled, "Pulled remote rows missing locally");
        }
        Ok(pulled)
    }

    /// Record a conflict and apply the configured strategy.
    ///
    /// Returns whether the conflict was resolved. The record is only marked
    /// resolved after the winning value is written.
    async fn handle_conflict(&self, local: StorageItem, remote: StorageItem) -> Result<bool, StorageError> {
        let decision = conflict::decide(self.config.conflict_strategy, &local, &remote);
        let now = now_millis();
        let mut record = match self.open_conflict(&local.collection, &local.id).await? {
            Some(mut existing) => {
                existing.local = local.clone();
                existing.remote = remote.clone();
                existing.strategy = decision.strategy;
                existing.timestamp = now;
                existing
            }
            None => ConflictResolution {
                id: uuid::Uuid::new_v4().to_string(),
                collection: local.collection.clone(),
                item_id: local.id.clone(),
                local: local.clone(),
                remote: remote.clone(),
                strategy: decision.strategy,
                resolved: false,
                superseded: false,
                timestamp: now,
                resolved_at: None,
                resolution: None,
            },
        };
        self.core.put_record(CONFLICT_COLLECTION, &record.id, &record).await?;
        metrics::record_sync_item("conflict");
        info!(
            collection = %local.collection,
            id = %local.id,
            conflict_id = %record.id,
            strategy = %decision.strategy,
            "Conflict detected"
        );

        let expected = Some(local.metadata.updated_at);
        let Some(winner) = decision.winner else {
            let parked = local.with_status(SyncStatus::Conflict, TierSource::LocalCache);
            if !self.core.replace_local(&parked, expected).await? {
                self.close_superseded(&mut record).await?;
                return Ok(false);
            }
            self.refresh_conflict_gauge().await;
            return Ok(false);
        };

        let remote_has_winner = decision.strategy == ResolutionStrategy::Remote;
        if !self.apply_winner(&winner, remote_has_winner, expected).await? {
            self.close_superseded(&mut record).await?;
            return Ok(false);
        }
        record.resolved = true;
        record.resolved_at = Some(now_millis());
        record.resolution = Some(winner.data);
        self.core.put_record(CONFLICT_COLLECTION, &record.id, &record).await?;
        self.refresh_conflict_gauge().await;
        Ok(true)
    }

    /// Write the winning value. Returns false when the local copy no longer
    /// matches `expected`, in which case the newer local revision is kept.
    async fn apply_winner(&self, winner: &StorageItem, remote_has_winner: bool, expected: Option<i64>) -> Result<bool, StorageError> {
        if !remote_has_winner {
            self.core.remote_upsert(winner).await?;
        }
        let synced = winner.clone().with_status(SyncStatus::Synced, TierSource::Authoritative);
        let applied = self.core.replace_local(&synced, expected).await?;
        if !applied {
            debug!(key = %winner.key(), "Local copy changed while applying conflict winner");
        }
        Ok(applied)
    }

    /// Close a conflict whose item moved on before a winner was written.
    async fn close_superseded(&self, record: &mut ConflictResolution) -> Result<(), StorageError> {
        record.resolved = true;
        record.superseded = true;
        record.resolved_at = Some(now_millis());
        record.resolution = None;
        self.core.put_record(CONFLICT_COLLECTION, &record.id, record).await?;
        self.refresh_conflict_gauge().await;
        info!(conflict_id = %record.id, key = %record.local.key(), "Conflict superseded by a newer revision");
        Ok(())
    }

    async fn open_conflict(&self, collection: &str, item_id: &str) -> Result<Option<ConflictResolution>, StorageError> {
        Ok(self
            .core
            .list_records::<ConflictResolution>(CONFLICT_COLLECTION)
            .await?
            .into_iter()
            .find(|c| !c.resolved && c.collection == collection && c.item_id == item_id))
    }

    /// Settle a conflict by operator decision.
    #[tracing::instrument(skip(self, resolution))]
    pub async fn resolve_conflict(&self, conflict_id: &str, resolution: ManualResolution) -> Result<ConflictResolution, SyncError> {
        let mut record: ConflictResolution = self
            .core
            .get_record(CONFLICT_COLLECTION, conflict_id)
            .await?
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        if record.resolved {
            return Err(SyncError::AlreadyResolved(conflict_id.to_string()));
        }

        let _item_guard = self.core.lock_item(&record.collection, &record.item_id).await;
        let parked = self
            .core
            .local_item(&record.collection, &record.item_id)
            .await?
            .map_or(false, |current| {
                current.metadata.sync_status == SyncStatus::Conflict
                    && current.metadata.updated_at == record.local.metadata.updated_at
                    && current.metadata.version == record.local.metadata.version
            });
        if !parked {
            warn!(conflict_id, "Item changed after the conflict was recorded");
            self.close_superseded(&mut record).await?;
            return Err(SyncError::StaleConflict(conflict_id.to_string()));
        }

        let expected = Some(record.local.metadata.updated_at);
        let (local, remote) = (&record.local, &record.remote);
        let (winner, strategy, remote_has_winner) = match resolution {
            ManualResolution::KeepRemote => {
                // Keep what the authoritative tier holds now, not the recorded copy
                let current = self
                    .core
                    .remote_get(&record.collection, &record.item_id)
                    .await?
                    .filter(StorageItem::checksum_matches)
                    .ok_or_else(|| SyncError::StaleConflict(conflict_id.to_string()))?;
                (current, ResolutionStrategy::Remote, true)
            }
            ManualResolution::KeepLocal => (
                conflict::supersede(local, remote, local.data.clone()),
                ResolutionStrategy::Local,
                false,
            ),
            ManualResolution::Merge => (
                conflict::supersede(local, remote, conflict::merge_values(&remote.data, &local.data)),
                ResolutionStrategy::Merge,
                false,
            ),
            ManualResolution::Custom(value) => (
                conflict::supersede(local, remote, value),
                ResolutionStrategy::Manual,
                false,
            ),
        };

        if !self.apply_winner(&winner, remote_has_winner, expected).await? {
            self.close_superseded(&mut record).await?;
            return Err(SyncError::StaleConflict(conflict_id.to_string()));
        }
        record.strategy = strategy;
        record.resolved = true;
        record.resolved_at = Some(now_millis());
        record.resolution = Some(winner.data);
        self.core.put_record(CONFLICT_COLLECTION, &record.id, &record).await?;
        self.refresh_conflict_gauge().await;
        info!(conflict_id, strategy = %strategy, "Conflict resolved by operator");
        Ok(record)
    }

    /// Conflict records, oldest first.
    pub async fn conflicts(&self, unresolved_only: bool) -> Result<Vec<ConflictResolution>, StorageError> {
        let mut records: Vec<ConflictResolution> = self.core.list_records(CONFLICT_COLLECTION).await?;
        if unresolved_only {
            records.retain(|c| !c.resolved);
        }
        records.sort_by_key(|c| c.timestamp);
        Ok(records)
    }

    pub async fn unresolved_conflict_count(&self) -> Result<usize, StorageError> {
        Ok(self.conflicts(true).await?.len())
    }

    async fn refresh_conflict_gauge(&self) {
        if let Ok(count) = self.unresolved_conflict_count().await {
            metrics::set_unresolved_conflicts(count);
        }
    }

    /// Full sweep on a fixed interval until cancelled.
    pub async fn run_batch(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.batch_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.perform_full_sync().await;
                }
            }
        }
        debug!("Batch sync loop stopped");
    }

    /// Run every driver for the configured mode until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(mode = ?self.config.mode, strategy = ?self.config.conflict_strategy, "Sync engine started");
        let listener = self.run_event_listener(cancel.clone());
        match self.config.mode {
            SyncMode::Manual => {
                listener.await;
            }
            SyncMode::Batch => {
                tokio::join!(listener, self.run_queue_processor(cancel.clone()), self.run_batch(cancel));
            }
            SyncMode::Realtime => {
                tokio::join!(listener, self.run_queue_processor(cancel.clone()), self.run_realtime(cancel));
            }
            SyncMode::Adaptive => {
                tokio::join!(
                    listener,
                    self.run_queue_processor(cancel.clone()),
                    self.run_connectivity_monitor(cancel.clone()),
                    self.run_realtime(cancel),
                );
            }
        }
        info!("Sync engine stopped");
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("mode", &self.config.mode)
            .field("strategy", &self.config.conflict_strategy)
            .field("connectivity", &self.connectivity())
            .finish_non_exhaustive()
    }
}
