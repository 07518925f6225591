use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::backup::types::{BackupMetadata, BackupRecord};
use crate::storage_item::{ItemMetadata, StorageItem, SyncStatus, TierSource};

/// Collection probed by the default [`RemoteStore::ping`].
pub const HEALTH_COLLECTION: &str = "_health";
/// Row id probed by the default [`RemoteStore::ping`].
pub const HEALTH_PROBE_ID: &str = "__health_check__";

/// The three storage tiers, most reliable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    Authoritative,
    Cache,
    Fallback,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authoritative => write!(f, "authoritative"),
            Self::Cache => write!(f, "cache"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

impl From<Tier> for TierSource {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Authoritative => TierSource::Authoritative,
            Tier::Cache => TierSource::LocalCache,
            Tier::Fallback => TierSource::Fallback,
        }
    }
}

/// One failed attempt against one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFailure {
    pub tier: Tier,
    pub error: String,
}

impl TierFailure {
    pub fn new(tier: Tier, error: impl std::fmt::Display) -> Self {
        Self { tier, error: error.to_string() }
    }
}

impl std::fmt::Display for TierFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tier, self.error)
    }
}

fn describe_failures(failures: &[TierFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("Invalid data: {0}")]
    Invalid(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("{tier} tier timed out after {timeout_ms}ms")]
    Timeout { tier: Tier, timeout_ms: u64 },
    #[error("{tier} tier circuit open, request rejected")]
    CircuitOpen { tier: Tier },
    #[error("{tier} tier is not configured")]
    NotConfigured { tier: Tier },
    #[error("All storage tiers failed: {}", describe_failures(.0))]
    AllTiersFailed(Vec<TierFailure>),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Row shape exchanged with the authoritative tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    pub id: String,
    pub data: Value,
    pub metadata: ItemMetadata,
    pub updated_at: i64,
}

impl RemoteRow {
    /// Row for pushing `item` to the authoritative tier.
    pub fn from_item(item: &StorageItem) -> Self {
        let mut metadata = item.metadata.clone();
        metadata.source = TierSource::Authoritative;
        metadata.sync_status = SyncStatus::Synced;
        Self {
            id: item.id.clone(),
            data: item.data.clone(),
            updated_at: metadata.updated_at,
            metadata,
        }
    }

    /// Local view of this row, marked synced from the authoritative tier.
    pub fn into_item(self, collection: &str) -> StorageItem {
        let mut metadata = self.metadata;
        metadata.updated_at = self.updated_at;
        metadata.source = TierSource::Authoritative;
        metadata.sync_status = SyncStatus::Synced;
        StorageItem {
            id: self.id,
            collection: collection.to_string(),
            data: self.data,
            metadata,
        }
    }
}

/// Row filter understood by every [`RemoteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    Id(String),
    /// Rows with `updated_at >= since` (epoch millis)
    UpdatedSince(i64),
}

impl RowFilter {
    #[must_use]
    pub fn matches(&self, row: &RemoteRow) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => &row.id == id,
            Self::UpdatedSince(since) => row.updated_at >= *since,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Change-feed event delivered by the authoritative tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub event_type: ChangeKind,
    pub new: Option<RemoteRow>,
    pub old: Option<RemoteRow>,
}

/// One entry of the local cache `error_log` store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: String,
    pub timestamp: i64,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub context: Value,
}

/// Authoritative (networked) tier: per-collection CRUD plus a change feed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, collection: &str, filter: &RowFilter) -> Result<Vec<RemoteRow>, StorageError>;
    /// Fails if a row with the same id already exists.
    async fn insert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError>;
    /// Replaces data and metadata of every matching row, returns rows touched.
    async fn update(&self, collection: &str, filter: &RowFilter, patch: &RemoteRow) -> Result<u64, StorageError>;
    async fn delete(&self, collection: &str, filter: &RowFilter) -> Result<u64, StorageError>;
    async fn upsert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError>;

    /// Subscribe to the change feed. `None` when the store has no feed.
    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>>;

    /// Lightweight reachability probe.
    async fn ping(&self) -> Result<(), StorageError> {
        self.select(HEALTH_COLLECTION, &RowFilter::Id(HEALTH_PROBE_ID.to_string()))
            .await
            .map(|_| ())
    }
}

/// Durable local cache with four logical stores:
/// `data`, `sync_metadata`, `backups` and `error_log`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    // data
    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<StorageItem>, StorageError>;
    async fn put_item(&self, item: &StorageItem) -> Result<(), StorageError>;
    async fn delete_item(&self, collection: &str, id: &str) -> Result<(), StorageError>;
    async fn list_items(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError>;
    async fn list_by_status(&self, collection: &str, status: SyncStatus) -> Result<Vec<StorageItem>, StorageError>;
    async fn collections(&self) -> Result<Vec<String>, StorageError>;
    async fn count_items(&self) -> Result<u64, StorageError>;

    // sync_metadata
    async fn last_sync(&self, collection: &str) -> Result<Option<i64>, StorageError>;
    async fn set_last_sync(&self, collection: &str, timestamp: i64) -> Result<(), StorageError>;

    // backups
    async fn put_backup(&self, record: &BackupRecord) -> Result<(), StorageError>;
    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, StorageError>;
    async fn list_backups(&self) -> Result<Vec<BackupMetadata>, StorageError>;
    async fn delete_backup(&self, id: &str) -> Result<bool, StorageError>;

    // error_log
    async fn append_error(&self, entry: &ErrorLogEntry) -> Result<(), StorageError>;
    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogEntry>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        self.count_items().await.map(|_| ())
    }
}

/// Last-resort key-value tier.
#[async_trait]
pub trait FallbackStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn remove(&self, key: &str) -> Result<(), StorageError>;
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        self.keys().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_filter_matches() {
        let item = StorageItem::new("orders", "o1", json!({"total": 1}));
        let row = RemoteRow::from_item(&item);

        assert!(RowFilter::All.matches(&row));
        assert!(RowFilter::Id("o1".into()).matches(&row));
        assert!(!RowFilter::Id("o2".into()).matches(&row));
        assert!(RowFilter::UpdatedSince(row.updated_at).matches(&row));
        assert!(!RowFilter::UpdatedSince(row.updated_at + 1).matches(&row));
    }

    #[test]
    fn test_row_round_trip_marks_synced() {
        let item = StorageItem::new("orders", "o1", json!({"total": 1}));
        let back = RemoteRow::from_item(&item).into_item("orders");

        assert_eq!(back.data, item.data);
        assert_eq!(back.metadata.sync_status, SyncStatus::Synced);
        assert_eq!(back.metadata.source, TierSource::Authoritative);
        assert_eq!(back.metadata.checksum, item.metadata.checksum);
    }

    #[test]
    fn test_all_tiers_failed_message_lists_tiers() {
        let err = StorageError::AllTiersFailed(vec![
            TierFailure::new(Tier::Authoritative, "down"),
            TierFailure::new(Tier::Cache, "disk full"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("authoritative: down"));
        assert!(msg.contains("cache: disk full"));
    }
}
