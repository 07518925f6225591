//! Change-feed driven reconciliation.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::ConnectivityState;
use super::{conflict, SyncEngine};
use crate::metrics;
use crate::storage::traits::{ChangeEvent, ChangeKind, StorageError};
use crate::storage_item::{SyncStatus, TierSource};

/// What a change-feed event did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Remote value copied into the cache
    Pulled,
    /// Pending local write confirmed by an identical remote value
    Confirmed,
    /// Synced local copy removed
    Removed,
    Conflict,
    Ignored,
}

enum FeedStep {
    Stop,
    Reconsider,
    Event(ChangeEvent),
    Lagged(u64),
    Closed,
}

impl SyncEngine {
    /// Apply one change-feed event.
    ///
    /// Inserts and updates are pulled when the local copy is missing, or
    /// synced and older. A pending local copy with different content
    /// becomes a conflict. Deletes drop a synced local copy and keep a
    /// pending one, which the next push will recreate remotely.
    pub async fn handle_change(&self, event: ChangeEvent) -> Result<ChangeOutcome, StorageError> {
        if !self.tracks(&event.table) {
            return Ok(ChangeOutcome::Ignored);
        }
        let lock = self.collection_lock(&event.table);
        let _guard = lock.lock().await;

        match event.event_type {
            ChangeKind::Insert | ChangeKind::Update => {
                let Some(row) = event.new else {
                    return Ok(ChangeOutcome::Ignored);
                };
                let remote = row.into_item(&event.table);
                if !remote.checksum_matches() {
                    warn!(collection = %event.table, id = %remote.id, "Ignoring change with bad checksum");
                    metrics::record_corruption(&event.table);
                    return Ok(ChangeOutcome::Ignored);
                }

                let _item_guard = self.core.lock_item(&event.table, &remote.id).await;
                let Some(local) = self.core.local_item(&event.table, &remote.id).await? else {
                    self.core.replace_local(&remote, None).await?;
                    return Ok(ChangeOutcome::Pulled);
                };
                let expected = Some(local.metadata.updated_at);
                match local.metadata.sync_status {
                    SyncStatus::Synced => {
                        if local.metadata.checksum != remote.metadata.checksum && !local.is_newer_than(&remote) {
                            self.core.replace_local(&remote, expected).await?;
                            Ok(ChangeOutcome::Pulled)
                        } else {
                            Ok(ChangeOutcome::Ignored)
                        }
                    }
                    SyncStatus::Conflict => Ok(ChangeOutcome::Ignored),
                    SyncStatus::Pending | SyncStatus::Offline => {
                        if local.metadata.checksum == remote.metadata.checksum {
                            let synced = local.with_status(SyncStatus::Synced, TierSource::Authoritative);
                            self.core.replace_local(&synced, expected).await?;
                            Ok(ChangeOutcome::Confirmed)
                        } else if conflict::is_conflict(&local, &remote) {
                            self.handle_conflict(local, remote).await?;
                            Ok(ChangeOutcome::Conflict)
                        } else {
                            Ok(ChangeOutcome::Ignored)
                        }
                    }
                }
            }
            ChangeKind::Delete => {
                let Some(id) = event.old.map(|row| row.id) else {
                    return Ok(ChangeOutcome::Ignored);
                };
                let _item_guard = self.core.lock_item(&event.table, &id).await;
                match self.core.local_item(&event.table, &id).await? {
                    Some(local) if local.metadata.sync_status == SyncStatus::Synced => {
                        self.core.remove_local(&event.table, &id).await?;
                        Ok(ChangeOutcome::Removed)
                    }
                    _ => Ok(ChangeOutcome::Ignored),
                }
            }
        }
    }

    /// Follow the change feed until cancelled.
    ///
    /// The subscription is dropped while connectivity is offline and taken
    /// again when it returns. Without a feed this degrades to batch sweeps.
    pub async fn run_realtime(&self, cancel: CancellationToken) {
        let mut connectivity = self.connectivity.subscribe();
        let mut feed: Option<broadcast::Receiver<ChangeEvent>> = None;

        loop {
            let online = *connectivity.borrow_and_update() == ConnectivityState::Online;
            if online && feed.is_none() {
                match self.core.subscribe_changes() {
                    Some(rx) => {
                        info!("Realtime sync subscribed to change feed");
                        feed = Some(rx);
                    }
                    None => {
                        warn!("Authoritative tier has no change feed, falling back to batch sweeps");
                        break;
                    }
                }
            } else if !online && feed.is_some() {
                info!("Realtime sync paused while offline");
                feed = None;
            }

            let step = match feed.as_mut() {
                Some(rx) => tokio::select! {
                    _ = cancel.cancelled() => FeedStep::Stop,
                    changed = connectivity.changed() => {
                        if changed.is_err() { FeedStep::Stop } else { FeedStep::Reconsider }
                    }
                    msg = rx.recv() => match msg {
                        Ok(event) => FeedStep::Event(event),
                        Err(RecvError::Lagged(missed)) => FeedStep::Lagged(missed),
                        Err(RecvError::Closed) => FeedStep::Closed,
                    },
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => FeedStep::Stop,
                    changed = connectivity.changed() => {
                        if changed.is_err() { FeedStep::Stop } else { FeedStep::Reconsider }
                    }
                },
            };

            match step {
                FeedStep::Stop => {
                    debug!("Realtime sync stopped");
                    return;
                }
                FeedStep::Reconsider => {}
                FeedStep::Event(event) => {
                    let table = event.table.clone();
                    match self.handle_change(event).await {
                        Ok(outcome) => debug!(collection = %table, ?outcome, "Change applied"),
                        Err(e) => warn!(collection = %table, error = %e, "Failed to apply change"),
                    }
                }
                FeedStep::Lagged(missed) => {
                    warn!(missed, "Change feed lagged, running full sync");
                    self.perform_full_sync().await;
                }
                FeedStep::Closed => {
                    warn!("Change feed closed, falling back to batch sweeps");
                    break;
                }
            }
        }
        self.run_batch(cancel).await;
    }
}
