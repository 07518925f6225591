//! Public types for the sync engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::WriteAction;
use crate::storage::traits::StorageError;
use crate::storage_item::{now_millis, StorageItem};

/// Internal collection holding queued propagations.
pub const QUEUE_COLLECTION: &str = "_sync_queue";
/// Internal collection holding conflict records.
pub const CONFLICT_COLLECTION: &str = "_conflicts";

/// How reconciliation is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Follow the authoritative change feed
    Realtime,
    /// Full sweep on a fixed interval
    Batch,
    /// Only when the caller asks
    Manual,
    /// Realtime while reachable, queued writes while not
    #[default]
    Adaptive,
}

/// What to do when local and remote copies diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Later `updated_at` wins
    #[default]
    LastWins,
    /// Remote as base, local fields on top
    Merge,
    /// Persist the conflict for an operator
    Manual,
}

/// Strategy recorded on a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Local,
    Remote,
    Merge,
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Merge => write!(f, "merge"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub synced: usize,
    pub conflicts: usize,
    pub errors: usize,
    /// Set when another pass for the collection was already running
    pub skipped: bool,
    pub duration: Duration,
}

impl SyncResult {
    pub(crate) fn skipped() -> Self {
        Self { skipped: true, ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullSyncReport {
    pub collections: BTreeMap<String, SyncResult>,
    /// Queue entries drained after the sweep (deletes, leftovers)
    pub queue: SyncResult,
    pub duration: Duration,
}

impl FullSyncReport {
    #[must_use]
    pub fn synced(&self) -> usize {
        self.collections.values().map(|r| r.synced).sum::<usize>() + self.queue.synced
    }

    #[must_use]
    pub fn errors(&self) -> usize {
        self.collections.values().map(|r| r.errors).sum::<usize>() + self.queue.errors
    }

    #[must_use]
    pub fn conflicts(&self) -> usize {
        self.collections.values().map(|r| r.conflicts).sum::<usize>() + self.queue.conflicts
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors() == 0
    }
}

/// A propagation that did not reach the authoritative tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Queue entry id, `collection:item_id`
    pub id: String,
    pub collection: String,
    pub item_id: String,
    pub action: WriteAction,
    /// Item snapshot at enqueue time; `None` for deletes
    pub data: Option<StorageItem>,
    /// Lower runs first
    pub priority: u8,
    pub timestamp: i64,
    pub retry_count: u32,
    #[serde(default)]
    pub permanently_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    pub fn new(collection: &str, item_id: &str, action: WriteAction, data: Option<StorageItem>) -> Self {
        Self {
            id: crate::storage_item::item_key(collection, item_id),
            collection: collection.to_string(),
            item_id: item_id.to_string(),
            action,
            data,
            priority: if action == WriteAction::Delete { 0 } else { 1 },
            timestamp: now_millis(),
            retry_count: 0,
            permanently_failed: false,
            last_error: None,
        }
    }
}

/// Audit record of a detected divergence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub id: String,
    pub collection: String,
    pub item_id: String,
    /// Local revision in conflict. An operator decision only applies while
    /// the cache still holds this revision parked as a conflict.
    pub local: StorageItem,
    pub remote: StorageItem,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    /// Closed without a decision because the item moved on
    #[serde(default)]
    pub superseded: bool,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<i64>,
    /// Value that was written when resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
}

/// Operator decision for a `manual` conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualResolution {
    KeepLocal,
    KeepRemote,
    Merge,
    Custom(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    #[default]
    Online,
    Offline,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("conflict '{0}' not found")]
    ConflictNotFound(String),
    #[error("conflict '{0}' is already resolved")]
    AlreadyResolved(String),
    #[error("conflict '{0}' is stale, the item changed after it was recorded")]
    StaleConflict(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_strategy_wire_names() {
        assert_eq!(serde_json::to_value(SyncMode::Adaptive).unwrap(), "adaptive");
        assert_eq!(serde_json::to_value(ConflictStrategy::LastWins).unwrap(), "last_wins");
        let parsed: ConflictStrategy = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(parsed, ConflictStrategy::Merge);
    }

    #[test]
    fn test_deletes_sort_first() {
        let delete = SyncQueueItem::new("orders", "o1", WriteAction::Delete, None);
        let update = SyncQueueItem::new("orders", "o2", WriteAction::Update, None);
        assert!(delete.priority < update.priority);
        assert_eq!(delete.id, "orders:o1");
    }

    #[test]
    fn test_full_report_totals() {
        let mut report = FullSyncReport::default();
        report.collections.insert("a".into(), SyncResult { synced: 2, errors: 1, ..Default::default() });
        report.collections.insert("b".into(), SyncResult { synced: 3, conflicts: 1, ..Default::default() });
        report.queue = SyncResult { synced: 1, ..Default::default() };
        assert_eq!(report.synced(), 6);
        assert_eq!(report.conflicts(), 1);
        assert!(!report.is_clean());
    }
}
