//! In-process implementations of the three tier traits.
//!
//! Used by tests, the fault-injection harness and embedders that want a
//! volatile stack. [`MemoryRemoteStore`] also emits a change feed so the
//! realtime sync path can be exercised without a database.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::traits::{
    CacheStore, ChangeEvent, ChangeKind, ErrorLogEntry, FallbackStore, RemoteRow, RemoteStore,
    RowFilter, StorageError,
};
use crate::backup::types::{BackupMetadata, BackupRecord};
use crate::storage_item::{item_key, StorageItem, SyncStatus};

/// Capacity of the change-feed channel; slow subscribers see `Lagged`.
const CHANGE_FEED_CAPACITY: usize = 1024;

/// Entries kept in the in-memory error log.
pub const ERROR_LOG_CAP: usize = 1000;

pub struct MemoryRemoteStore {
    tables: DashMap<String, BTreeMap<String, RemoteRow>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: DashMap::new(),
            changes,
        }
    }

    /// Rows in one collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.tables.get(collection).map(|t| t.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn row(&self, collection: &str, id: &str) -> Option<RemoteRow> {
        self.tables.get(collection).and_then(|t| t.get(id).cloned())
    }

    fn emit(&self, collection: &str, event_type: ChangeKind, new: Option<RemoteRow>, old: Option<RemoteRow>) {
        // No subscribers is fine
        let _ = self.changes.send(ChangeEvent {
            table: collection.to_string(),
            event_type,
            new,
            old,
        });
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn select(&self, collection: &str, filter: &RowFilter) -> Result<Vec<RemoteRow>, StorageError> {
        Ok(self
            .tables
            .get(collection)
            .map(|t| t.values().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        {
            let mut table = self.tables.entry(collection.to_string()).or_default();
            if table.contains_key(&row.id) {
                return Err(StorageError::Invalid(format!(
                    "duplicate id '{}' in '{}'",
                    row.id, collection
                )));
            }
            table.insert(row.id.clone(), row.clone());
        }
        self.emit(collection, ChangeKind::Insert, Some(row.clone()), None);
        Ok(())
    }

    async fn update(&self, collection: &str, filter: &RowFilter, patch: &RemoteRow) -> Result<u64, StorageError> {
        let mut changed = Vec::new();
        if let Some(mut table) = self.tables.get_mut(collection) {
            for row in table.values_mut().filter(|r| filter.matches(r)) {
                let old = row.clone();
                row.data = patch.data.clone();
                row.metadata = patch.metadata.clone();
                row.updated_at = patch.updated_at;
                changed.push((old, row.clone()));
            }
        }
        let count = changed.len() as u64;
        for (old, new) in changed {
            self.emit(collection, ChangeKind::Update, Some(new), Some(old));
        }
        Ok(count)
    }

    async fn delete(&self, collection: &str, filter: &RowFilter) -> Result<u64, StorageError> {
        let mut removed = Vec::new();
        if let Some(mut table) = self.tables.get_mut(collection) {
            table.retain(|_, row| {
                if filter.matches(row) {
                    removed.push(row.clone());
                    false
                } else {
                    true
                }
            });
        }
        let count = removed.len() as u64;
        for old in removed {
            self.emit(collection, ChangeKind::Delete, None, Some(old));
        }
        Ok(count)
    }

    async fn upsert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        let old = self
            .tables
            .entry(collection.to_string())
            .or_default()
            .insert(row.id.clone(), row.clone());
        let kind = if old.is_some() { ChangeKind::Update } else { ChangeKind::Insert };
        self.emit(collection, kind, Some(row.clone()), old);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.changes.subscribe())
    }
}

/// Volatile local cache holding all four logical stores.
pub struct MemoryCache {
    data: DashMap<String, StorageItem>,
    sync_metadata: DashMap<String, i64>,
    backups: DashMap<String, BackupRecord>,
    error_log: Mutex<VecDeque<ErrorLogEntry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            sync_metadata: DashMap::new(),
            backups: DashMap::new(),
            error_log: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop every data item (backups and logs survive).
    pub fn clear(&self) {
        self.data.clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<StorageItem>, StorageError> {
        Ok(self.data.get(&item_key(collection, id)).map(|r| r.value().clone()))
    }

    async fn put_item(&self, item: &StorageItem) -> Result<(), StorageError> {
        self.data.insert(item.key(), item.clone());
        Ok(())
    }

    async fn delete_item(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        self.data.remove(&item_key(collection, id));
        Ok(())
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        let mut items: Vec<StorageItem> = self
            .data
            .iter()
            .filter(|r| r.value().collection == collection)
            .map(|r| r.value().clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn list_by_status(&self, collection: &str, status: SyncStatus) -> Result<Vec<StorageItem>, StorageError> {
        Ok(self
            .list_items(collection)
            .await?
            .into_iter()
            .filter(|i| i.metadata.sync_status == status)
            .collect())
    }

    async fn collections(&self) -> Result<Vec<String>, StorageError> {
        let names: BTreeSet<String> = self.data.iter().map(|r| r.value().collection.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn count_items(&self) -> Result<u64, StorageError> {
        Ok(self.data.len() as u64)
    }

    async fn last_sync(&self, collection: &str) -> Result<Option<i64>, StorageError> {
        Ok(self.sync_metadata.get(collection).map(|r| *r.value()))
    }

    async fn set_last_sync(&self, collection: &str, timestamp: i64) -> Result<(), StorageError> {
        self.sync_metadata.insert(collection.to_string(), timestamp);
        Ok(())
    }

    async fn put_backup(&self, record: &BackupRecord) -> Result<(), StorageError> {
        self.backups.insert(record.metadata.id.clone(), record.clone());
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, StorageError> {
        Ok(self.backups.get(id).map(|r| r.value().clone()))
    }

    async fn list_backups(&self) -> Result<Vec<BackupMetadata>, StorageError> {
        let mut all: Vec<BackupMetadata> = self.backups.iter().map(|r| r.value().metadata.clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(all)
    }

    async fn delete_backup(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.backups.remove(id).is_some())
    }

    async fn append_error(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        let mut log = self.error_log.lock();
        log.push_back(entry.clone());
        while log.len() > ERROR_LOG_CAP {
            log.pop_front();
        }
        Ok(())
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogEntry>, StorageError> {
        Ok(self.error_log.lock().iter().rev().take(limit).cloned().collect())
    }
}

/// Volatile key-value fallback tier.
#[derive(Default)]
pub struct MemoryFallback {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryFallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FallbackStore for MemoryFallback {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self.entries.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::BackupType;
    use serde_json::json;
    use std::sync::Arc;

    fn item(collection: &str, id: &str) -> StorageItem {
        StorageItem::new(collection, id, json!({"id": id}))
    }

    #[tokio::test]
    async fn test_cache_put_get_delete() {
        let cache = MemoryCache::new();
        cache.put_item(&item("orders", "o1")).await.unwrap();

        let got = cache.get_item("orders", "o1").await.unwrap().unwrap();
        assert_eq!(got.id, "o1");
        assert!(cache.get_item("users", "o1").await.unwrap().is_none());

        cache.delete_item("orders", "o1").await.unwrap();
        assert!(cache.get_item("orders", "o1").await.unwrap().is_none());
        assert!(cache.delete_item("orders", "missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_cache_lists_by_collection_and_status() {
        let cache = MemoryCache::new();
        cache.put_item(&item("orders", "b")).await.unwrap();
        cache.put_item(&item("orders", "a")).await.unwrap();
        cache
            .put_item(&item("users", "u1").with_status(SyncStatus::Synced, crate::TierSource::Authoritative))
            .await
            .unwrap();

        let ids: Vec<String> = cache.list_items("orders").await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(cache.list_by_status("orders", SyncStatus::Pending).await.unwrap().len(), 2);
        assert_eq!(cache.list_by_status("users", SyncStatus::Pending).await.unwrap().len(), 0);
        assert_eq!(cache.collections().await.unwrap(), vec!["orders", "users"]);
        assert_eq!(cache.count_items().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cache_backups_newest_first() {
        let cache = MemoryCache::new();
        for (id, at) in [("old", 1), ("new", 5), ("mid", 3)] {
            let mut metadata = BackupMetadata::in_progress(id.into(), id.into(), None, BackupType::Manual, vec![]);
            metadata.created_at = at;
            cache.put_backup(&BackupRecord { metadata, blob: vec![] }).await.unwrap();
        }

        let ids: Vec<String> = cache.list_backups().await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert!(cache.delete_backup("mid").await.unwrap());
        assert!(!cache.delete_backup("mid").await.unwrap());
    }

    #[tokio::test]
    async fn test_error_log_is_bounded_and_newest_first() {
        let cache = MemoryCache::new();
        for i in 0..(ERROR_LOG_CAP + 5) {
            cache
                .append_error(&ErrorLogEntry {
                    id: i.to_string(),
                    timestamp: i as i64,
                    kind: "test".into(),
                    message: "boom".into(),
                    context: json!({}),
                })
                .await
                .unwrap();
        }
        let recent = cache.recent_errors(3).await.unwrap();
        assert_eq!(recent[0].id, (ERROR_LOG_CAP + 4).to_string());
        assert_eq!(cache.recent_errors(usize::MAX).await.unwrap().len(), ERROR_LOG_CAP);
    }

    #[tokio::test]
    async fn test_remote_crud_and_feed() {
        let remote = MemoryRemoteStore::new();
        let mut feed = remote.subscribe().unwrap();
        let row = RemoteRow::from_item(&item("orders", "o1"));

        remote.insert("orders", &row).await.unwrap();
        assert!(remote.insert("orders", &row).await.is_err());

        let mut patch = row.clone();
        patch.data = json!({"id": "o1", "total": 2});
        assert_eq!(remote.update("orders", &RowFilter::Id("o1".into()), &patch).await.unwrap(), 1);
        assert_eq!(remote.row("orders", "o1").unwrap().data["total"], 2);

        assert_eq!(remote.delete("orders", &RowFilter::All).await.unwrap(), 1);
        assert_eq!(remote.len("orders"), 0);

        let kinds: Vec<ChangeKind> = (0..3).map(|_| feed.try_recv().unwrap().event_type).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }

    #[tokio::test]
    async fn test_remote_upsert_and_ping() {
        let remote = MemoryRemoteStore::new();
        let row = RemoteRow::from_item(&item("orders", "o1"));
        remote.upsert("orders", &row).await.unwrap();
        remote.upsert("orders", &row).await.unwrap();

        assert_eq!(remote.len("orders"), 1);
        assert!(remote.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_fallback_kv() {
        let fallback = MemoryFallback::new();
        fallback.put("orders:o1", b"{}").await.unwrap();

        assert_eq!(fallback.get("orders:o1").await.unwrap().unwrap(), b"{}");
        assert_eq!(fallback.keys().await.unwrap(), vec!["orders:o1"]);
        fallback.remove("orders:o1").await.unwrap();
        assert!(fallback.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_cache_writes() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = vec![];

        for batch in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    cache.put_item(&item("load", &format!("{}-{}", batch, i))).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cache.len(), 100);
    }
}
