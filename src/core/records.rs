//! Bookkeeping records and backup blobs.
//!
//! Internal collections (`_sync_queue`, `_conflicts`, ...) are stored as
//! ordinary cache items marked synced, so they never reach the
//! authoritative tier and stay out of sweeps, exports and backups.

use rand::seq::IteratorRandom;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::StorageCore;
use crate::backup::types::{BackupDestination, BackupMetadata, BackupRecord};
use crate::storage::traits::{RemoteRow, RowFilter, StorageError, Tier};
use crate::storage_item::{is_internal_collection, StorageItem, SyncStatus, TierSource};

/// Remote collection holding backup records sent to the authoritative tier.
pub const REMOTE_BACKUP_COLLECTION: &str = "_backups";

fn internal_only(collection: &str) -> Result<(), StorageError> {
    if is_internal_collection(collection) {
        Ok(())
    } else {
        Err(StorageError::Invalid(format!("'{}' is not an internal collection", collection)))
    }
}

impl StorageCore {
    pub(crate) async fn put_record<T: Serialize>(&self, collection: &str, id: &str, record: &T) -> Result<(), StorageError> {
        internal_only(collection)?;
        let data = serde_json::to_value(record)?;
        let _guard = self.write_lock.lock().await;
        let item = match self.cache.get_item(collection, id).await? {
            Some(prev) => prev.revise(data),
            None => StorageItem::new(collection, id, data),
        }
        .with_status(SyncStatus::Synced, TierSource::LocalCache);
        self.cache.put_item(&item).await
    }

    pub(crate) async fn get_record<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, StorageError> {
        match self.cache.get_item(collection, id).await? {
            Some(item) => Ok(Some(serde_json::from_value(item.data)?)),
            None => Ok(None),
        }
    }

    /// Every record of an internal collection. Undecodable rows are skipped.
    pub(crate) async fn list_records<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>, StorageError> {
        let items = self.cache.list_items(collection).await?;
        Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item.data) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(collection, id = %item.id, error = %e, "Skipping undecodable record");
                    None
                }
            })
            .collect())
    }

    pub(crate) async fn delete_record(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        internal_only(collection)?;
        let _guard = self.write_lock.lock().await;
        self.cache.delete_item(collection, id).await
    }

    /// Persist a backup to its destination tier.
    ///
    /// Authoritative backups keep only their metadata in the local cache so
    /// they remain listable while the blob lives remotely.
    pub(crate) async fn store_backup(&self, record: &BackupRecord) -> Result<(), StorageError> {
        match record.metadata.destination {
            BackupDestination::LocalCache => self.cache.put_backup(record).await,
            BackupDestination::Authoritative => {
                let row = RemoteRow {
                    id: record.metadata.id.clone(),
                    data: serde_json::to_value(record)?,
                    metadata: StorageItem::new(REMOTE_BACKUP_COLLECTION, &record.metadata.id, serde_json::Value::Null)
                        .metadata,
                    updated_at: record.metadata.created_at,
                };
                self.guarded("backup_store", |r| async move { r.upsert(REMOTE_BACKUP_COLLECTION, &row).await })
                    .await?;
                self.cache
                    .put_backup(&BackupRecord { metadata: record.metadata.clone(), blob: Vec::new() })
                    .await
            }
        }
    }

    /// Load a backup with its blob, fetching it remotely when needed.
    pub(crate) async fn load_backup(&self, id: &str) -> Result<Option<BackupRecord>, StorageError> {
        let local = self.cache.get_backup(id).await?;
        let wants_remote = local
            .as_ref()
            .map_or(false, |r| r.metadata.destination == BackupDestination::Authoritative);
        if !wants_remote {
            return Ok(local);
        }

        let filter = RowFilter::Id(id.to_string());
        let rows = self
            .guarded("backup_load", |r| async move { r.select(REMOTE_BACKUP_COLLECTION, &filter).await })
            .await?;
        match rows.into_iter().next() {
            Some(row) => {
                let mut remote: BackupRecord = serde_json::from_value(row.data)?;
                // Local metadata carries the latest status
                if let Some(local) = local {
                    remote.metadata = local.metadata;
                }
                Ok(Some(remote))
            }
            None => Err(StorageError::NotFound),
        }
    }

    /// Metadata of every stored backup, newest first.
    pub(crate) async fn backup_index(&self) -> Result<Vec<BackupMetadata>, StorageError> {
        self.cache.list_backups().await
    }

    /// Replace the metadata of a stored backup, keeping its blob.
    pub(crate) async fn save_backup_metadata(&self, metadata: &BackupMetadata) -> Result<(), StorageError> {
        let blob = match self.cache.get_backup(&metadata.id).await? {
            Some(existing) => existing.blob,
            None => Vec::new(),
        };
        self.cache
            .put_backup(&BackupRecord { metadata: metadata.clone(), blob })
            .await
    }

    pub(crate) async fn remove_backup(&self, id: &str) -> Result<bool, StorageError> {
        let Some(existing) = self.cache.get_backup(id).await? else {
            return Ok(false);
        };
        if existing.metadata.destination == BackupDestination::Authoritative {
            let filter = RowFilter::Id(id.to_string());
            if let Err(e) = self
                .guarded("backup_delete", |r| async move { r.delete(REMOTE_BACKUP_COLLECTION, &filter).await })
                .await
            {
                warn!(backup_id = id, tier = %Tier::Authoritative, error = %e, "Remote backup blob left behind");
            }
        }
        self.cache.delete_backup(id).await
    }

    // Accessors used by the sync engine.

    pub(crate) async fn local_item(&self, collection: &str, id: &str) -> Result<Option<StorageItem>, StorageError> {
        self.cache.get_item(collection, id).await
    }

    /// Items that still need reconciliation (`pending` or `offline`).
    pub(crate) async fn pending_items(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        let mut items = self.cache.list_by_status(collection, SyncStatus::Pending).await?;
        items.extend(self.cache.list_by_status(collection, SyncStatus::Offline).await?);
        Ok(items)
    }

    /// Compare-and-set on the local copy: writes `item` only if the cached
    /// `updated_at` still equals `expected` (`None` = no local copy).
    /// Returns false when a newer local write got there first.
    pub(crate) async fn replace_local(&self, item: &StorageItem, expected: Option<i64>) -> Result<bool, StorageError> {
        {
            let _guard = self.write_lock.lock().await;
            let current = self
                .cache
                .get_item(&item.collection, &item.id)
                .await?
                .map(|i| i.metadata.updated_at);
            if current != expected {
                return Ok(false);
            }
            self.cache.put_item(item).await?;
        }
        if item.metadata.sync_status == SyncStatus::Synced {
            let _ = self.fallback.remove(&item.key()).await;
        }
        Ok(true)
    }

    pub(crate) async fn remove_local(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        {
            let _guard = self.write_lock.lock().await;
            self.cache.delete_item(collection, id).await?;
        }
        let _ = self.fallback.remove(&crate::storage_item::item_key(collection, id)).await;
        Ok(())
    }

    pub(crate) async fn remote_get(&self, collection: &str, id: &str) -> Result<Option<StorageItem>, StorageError> {
        let rows = self.remote_select(collection, RowFilter::Id(id.to_string())).await?;
        Ok(rows.into_iter().next())
    }

    pub(crate) async fn remote_select(&self, collection: &str, filter: RowFilter) -> Result<Vec<StorageItem>, StorageError> {
        let coll = collection.to_string();
        let rows = self
            .guarded("select", |r| async move { r.select(&coll, &filter).await })
            .await?;
        Ok(rows.into_iter().map(|row| row.into_item(collection)).collect())
    }

    pub(crate) async fn remote_upsert(&self, item: &StorageItem) -> Result<(), StorageError> {
        let row = RemoteRow::from_item(item);
        let coll = item.collection.clone();
        self.guarded("upsert", |r| async move { r.upsert(&coll, &row).await }).await
    }

    pub(crate) async fn remote_delete(&self, collection: &str, id: &str) -> Result<u64, StorageError> {
        let coll = collection.to_string();
        let filter = RowFilter::Id(id.to_string());
        self.guarded("delete", |r| async move { r.delete(&coll, &filter).await }).await
    }

    pub(crate) async fn last_sync(&self, collection: &str) -> Result<Option<i64>, StorageError> {
        self.cache.last_sync(collection).await
    }

    pub(crate) async fn set_last_sync(&self, collection: &str, timestamp: i64) -> Result<(), StorageError> {
        self.cache.set_last_sync(collection, timestamp).await
    }

    /// Item count of the local cache.
    pub async fn cache_size(&self) -> Result<u64, StorageError> {
        self.cache.count_items().await
    }

    /// Up to `limit` locally cached items of a collection, drawn at random
    /// so repeated scans cover the whole collection.
    pub async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<StorageItem>, StorageError> {
        let items = self.cache.list_items(collection).await?;
        if items.len() <= limit {
            return Ok(items);
        }
        Ok(items.into_iter().choose_multiple(&mut rand::thread_rng(), limit))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::backup::types::BackupType;
    use crate::config::StorageConfig;
    use crate::storage::memory::{MemoryCache, MemoryFallback, MemoryRemoteStore};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn core(remote: Option<Arc<MemoryRemoteStore>>) -> StorageCore {
        StorageCore::new(
            StorageConfig::default(),
            remote.map(|r| r as Arc<dyn crate::storage::RemoteStore>),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryFallback::new()),
        )
    }

    fn record(id: &str, destination: BackupDestination) -> BackupRecord {
        let mut metadata = BackupMetadata::in_progress(id.into(), "test".into(), None, BackupType::Manual, vec![]);
        metadata.destination = destination;
        BackupRecord { metadata, blob: vec![1, 2, 3] }
    }

    #[tokio::test]
    async fn test_records_round_trip_and_stay_local() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let core = core(Some(remote.clone()));
        core.put_record("_notes", "n1", &Note { text: "hi".into() }).await.unwrap();

        let back: Option<Note> = core.get_record("_notes", "n1").await.unwrap();
        assert_eq!(back, Some(Note { text: "hi".into() }));
        assert_eq!(core.list_records::<Note>("_notes").await.unwrap().len(), 1);
        assert_eq!(remote.len("_notes"), 0);
        assert!(core.pending_items("_notes").await.unwrap().is_empty());

        core.delete_record("_notes", "n1").await.unwrap();
        assert!(core.get_record::<Note>("_notes", "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_require_internal_collection() {
        let core = core(None);
        let err = core.put_record("notes", "n1", &json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_remote_backup_keeps_blob_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let core = core(Some(remote.clone()));
        core.store_backup(&record("b1", BackupDestination::Authoritative)).await.unwrap();

        assert_eq!(remote.len(REMOTE_BACKUP_COLLECTION), 1);
        let loaded = core.load_backup("b1").await.unwrap().unwrap();
        assert_eq!(loaded.blob, vec![1, 2, 3]);
        assert_eq!(core.backup_index().await.unwrap().len(), 1);

        assert!(core.remove_backup("b1").await.unwrap());
        assert_eq!(remote.len(REMOTE_BACKUP_COLLECTION), 0);
        assert!(!core.remove_backup("b1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sample_reaches_every_item() {
        let core = core(None);
        for i in 0..30 {
            core.set("orders", &format!("o{}", i), json!({"n": i})).await.unwrap();
        }
        let mut damaged = core.local_item("orders", "o29").await.unwrap().unwrap();
        damaged.data = json!({"n": -1});
        core.cache.put_item(&damaged).await.unwrap();

        let mut hits = 0;
        for _ in 0..20 {
            let sample = core.sample("orders", 20).await.unwrap();
            assert_eq!(sample.len(), 20);
            hits += sample.iter().filter(|item| item.validate().is_err()).count();
        }
        assert!(hits > 0, "damaged item never sampled");
        assert_eq!(core.sample("orders", 50).await.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_metadata_update_keeps_blob() {
        let core = core(None);
        let mut rec = record("b1", BackupDestination::LocalCache);
        core.store_backup(&rec).await.unwrap();

        rec.metadata.mark_completed(3, "abc".into()).unwrap();
        core.save_backup_metadata(&rec.metadata).await.unwrap();

        let loaded = core.load_backup("b1").await.unwrap().unwrap();
        assert_eq!(loaded.blob, vec![1, 2, 3]);
        assert_eq!(loaded.metadata.checksum, "abc");
    }
}
