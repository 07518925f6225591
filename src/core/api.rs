//! Caller-facing operations: set, get, delete, list, export/import, stats.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::types::{
    CollectionStats, DeleteReport, ExportEnvelope, ImportReport, ReadOutcome, StorageEvent,
    StorageStats, WriteAction, WriteReport, EXPORT_VERSION,
};
use super::StorageCore;
use crate::metrics;
use crate::storage::traits::{ErrorLogEntry, RemoteRow, RowFilter, StorageError, Tier, TierFailure};
use crate::storage_item::{
    is_internal_collection, item_key, now_millis, StorageItem, SyncStatus, TierSource,
};

fn check_name(collection: &str, id: &str) -> Result<(), StorageError> {
    if collection.is_empty() || id.is_empty() {
        return Err(StorageError::Invalid("collection and id must be non-empty".into()));
    }
    if is_internal_collection(collection) {
        return Err(StorageError::Invalid(format!("'{}' is a reserved collection", collection)));
    }
    Ok(())
}

impl StorageCore {
    /// Write `data`, local cache first, then the authoritative tier.
    ///
    /// Fails only if every tier rejected the write.
    #[tracing::instrument(skip(self, data))]
    pub async fn set(&self, collection: &str, id: &str, data: Value) -> Result<WriteReport, StorageError> {
        check_name(collection, id)?;
        let _item_guard = self.lock_item(collection, id).await;
        let mut failures = Vec::new();

        let (mut item, action, cache_ok) = {
            let _guard = self.write_lock.lock().await;
            let existing = match self.cache.get_item(collection, id).await {
                Ok(existing) => existing,
                Err(e) => {
                    warn!(collection, id, error = %e, "Cache read failed before write");
                    failures.push(TierFailure::new(Tier::Cache, &e));
                    None
                }
            };
            let action = if existing.is_some() { WriteAction::Update } else { WriteAction::Create };
            let mut item = match existing {
                Some(prev) => prev.revise(data),
                None => StorageItem::new(collection, id, data),
            };
            if self.remote.is_none() {
                item.metadata.sync_status = SyncStatus::Offline;
            }

            let cache_ok = match self.cache.put_item(&item).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(collection, id, error = %e, "Cache write failed");
                    if !failures.iter().any(|f| f.tier == Tier::Cache) {
                        failures.push(TierFailure::new(Tier::Cache, &e));
                    }
                    false
                }
            };
            (item, action, cache_ok)
        };
        metrics::record_operation("cache", "set", if cache_ok { "success" } else { "error" });

        let mut remote_ok = false;
        if self.remote.is_some() {
            let row = RemoteRow::from_item(&item);
            let coll = collection.to_string();
            match self.guarded("set", |r| async move { r.upsert(&coll, &row).await }).await {
                Ok(()) => {
                    remote_ok = true;
                    let written_at = item.metadata.updated_at;
                    item = item.with_status(SyncStatus::Synced, TierSource::Authoritative);
                    if cache_ok {
                        // Only this revision is marked synced; anything newer stays pending
                        match self.replace_local(&item, Some(written_at)).await {
                            Ok(true) => {}
                            Ok(false) => debug!(collection, id, "Local copy moved on, leaving it pending"),
                            Err(e) => warn!(collection, id, error = %e, "Failed to mark item synced in cache"),
                        }
                    } else {
                        // A stale copy from an earlier outage must not shadow this version
                        let _ = self.fallback.remove(&item.key()).await;
                    }
                }
                Err(e) => {
                    warn!(collection, id, error = %e, "Propagation to authoritative tier failed");
                    metrics::record_propagation_failure(collection);
                    failures.push(TierFailure::new(Tier::Authoritative, &e));
                    self.emit(StorageEvent::PropagationFailed {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        action,
                        item: Some(item.clone()),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut fallback_ok = false;
        if !remote_ok {
            let mut copy = item.clone();
            if !cache_ok {
                copy.metadata.source = TierSource::Fallback;
            }
            match serde_json::to_vec(&copy) {
                Ok(bytes) => match self.fallback.put(&item.key(), &bytes).await {
                    Ok(()) => fallback_ok = true,
                    Err(e) => {
                        warn!(collection, id, error = %e, "Fallback write failed");
                        failures.push(TierFailure::new(Tier::Fallback, &e));
                    }
                },
                Err(e) => failures.push(TierFailure::new(Tier::Fallback, e)),
            }
            if !cache_ok {
                item = copy;
            }
        }

        if !cache_ok && !remote_ok && !fallback_ok {
            metrics::record_operation("all", "set", "error");
            return Err(StorageError::AllTiersFailed(failures));
        }
        debug!(collection, id, version = item.metadata.version, status = %item.metadata.sync_status, "Item written");
        Ok(WriteReport { item, failures })
    }

    /// Serialize `value` and [`Self::set`] it.
    pub async fn set_as<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<WriteReport, StorageError> {
        self.set(collection, id, serde_json::to_value(value)?).await
    }

    /// Payload of an item, or `None` if no tier has it.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.read(collection, id).await?.item.map(|i| i.data))
    }

    pub async fn get_as<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, StorageError> {
        match self.get(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Read-through lookup reporting which tier answered.
    ///
    /// A local copy that is not yet synced wins over the authoritative one,
    /// so callers always read their own writes.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, collection: &str, id: &str) -> Result<ReadOutcome, StorageError> {
        let mut outcome = ReadOutcome::default();

        let local = match self.cache.get_item(collection, id).await {
            Ok(local) => local,
            Err(e) => {
                warn!(collection, id, error = %e, "Cache read failed");
                outcome.failures.push(TierFailure::new(Tier::Cache, &e));
                None
            }
        };
        let cache_failed = !outcome.failures.is_empty();

        if let Some(local) = &local {
            if local.metadata.sync_status != SyncStatus::Synced {
                outcome.item = Some(local.clone());
                outcome.served_by = Some(Tier::Cache);
                return Ok(outcome);
            }
        }

        let mut remote_failed = self.remote.is_none();
        if self.remote.is_some() {
            let coll = collection.to_string();
            let filter = RowFilter::Id(id.to_string());
            match self.guarded("get", |r| async move { r.select(&coll, &filter).await }).await {
                Ok(rows) => {
                    if let Some(row) = rows.into_iter().next() {
                        let remote = row.into_item(collection);
                        if remote.checksum_matches() {
                            let stale = local.as_ref().map_or(true, |l| {
                                l.metadata.checksum != remote.metadata.checksum
                                    || l.metadata.updated_at != remote.metadata.updated_at
                            });
                            if stale && !cache_failed {
                                let _guard = self.write_lock.lock().await;
                                if let Err(e) = self.cache.put_item(&remote).await {
                                    warn!(collection, id, error = %e, "Cache fill failed");
                                }
                            }
                            outcome.item = Some(remote);
                            outcome.served_by = Some(Tier::Authoritative);
                            return Ok(outcome);
                        }
                        warn!(collection, id, "Authoritative copy failed checksum, ignoring it");
                        metrics::record_corruption(collection);
                        outcome.failures.push(TierFailure::new(
                            Tier::Authoritative,
                            "checksum mismatch on authoritative copy",
                        ));
                        remote_failed = true;
                    }
                }
                Err(e) => {
                    debug!(collection, id, error = %e, "Authoritative read failed, falling back");
                    outcome.failures.push(TierFailure::new(Tier::Authoritative, &e));
                    remote_failed = true;
                }
            }
        }

        if let Some(local) = local {
            if remote_failed && self.remote.is_some() {
                metrics::record_read_fallback("cache");
            }
            outcome.item = Some(local);
            outcome.served_by = Some(Tier::Cache);
            return Ok(outcome);
        }

        let mut fallback_failed = false;
        match self.fallback.get(&item_key(collection, id)).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<StorageItem>(&bytes) {
                Ok(item) => {
                    metrics::record_read_fallback("fallback");
                    outcome.item = Some(item);
                    outcome.served_by = Some(Tier::Fallback);
                    return Ok(outcome);
                }
                Err(e) => {
                    outcome.failures.push(TierFailure::new(Tier::Fallback, e));
                    fallback_failed = true;
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(collection, id, error = %e, "Fallback read failed");
                outcome.failures.push(TierFailure::new(Tier::Fallback, &e));
                fallback_failed = true;
            }
        }

        if cache_failed && remote_failed && fallback_failed {
            return Err(StorageError::AllTiersFailed(outcome.failures));
        }
        Ok(outcome)
    }

    /// Remove an item from every tier.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, collection: &str, id: &str) -> Result<DeleteReport, StorageError> {
        check_name(collection, id)?;
        let _item_guard = self.lock_item(collection, id).await;
        let mut report = DeleteReport::default();
        let key = item_key(collection, id);

        let cache_ok = {
            let _guard = self.write_lock.lock().await;
            if let Ok(Some(_)) = self.cache.get_item(collection, id).await {
                report.existed = true;
            }
            match self.cache.delete_item(collection, id).await {
                Ok(()) => true,
                Err(e) => {
                    report.failures.push(TierFailure::new(Tier::Cache, &e));
                    false
                }
            }
        };

        let fallback_ok = match self.fallback.get(&key).await {
            Ok(found) => {
                report.existed |= found.is_some();
                match self.fallback.remove(&key).await {
                    Ok(()) => true,
                    Err(e) => {
                        report.failures.push(TierFailure::new(Tier::Fallback, &e));
                        false
                    }
                }
            }
            Err(e) => {
                report.failures.push(TierFailure::new(Tier::Fallback, &e));
                false
            }
        };

        let mut remote_ok = false;
        if self.remote.is_some() {
            let coll = collection.to_string();
            let filter = RowFilter::Id(id.to_string());
            match self.guarded("delete", |r| async move { r.delete(&coll, &filter).await }).await {
                Ok(_) => remote_ok = true,
                Err(e) => {
                    warn!(collection, id, error = %e, "Delete did not reach authoritative tier");
                    report.failures.push(TierFailure::new(Tier::Authoritative, &e));
                    self.emit(StorageEvent::PropagationFailed {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        action: WriteAction::Delete,
                        item: None,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !cache_ok && !fallback_ok && !remote_ok {
            return Err(StorageError::AllTiersFailed(report.failures));
        }
        Ok(report)
    }

    /// All locally held items of a collection, falling back to the fallback
    /// tier when the cache is unavailable.
    pub async fn list(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        match self.cache.list_items(collection).await {
            Ok(items) => Ok(items),
            Err(cache_err) => {
                warn!(collection, error = %cache_err, "Cache list failed, scanning fallback");
                let prefix = format!("{}:", collection);
                let keys = self.fallback.keys().await.map_err(|e| {
                    StorageError::AllTiersFailed(vec![
                        TierFailure::new(Tier::Cache, &cache_err),
                        TierFailure::new(Tier::Fallback, &e),
                    ])
                })?;
                let mut items = Vec::new();
                for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
                    if let Ok(Some(bytes)) = self.fallback.get(key).await {
                        if let Ok(item) = serde_json::from_slice::<StorageItem>(&bytes) {
                            items.push(item);
                        }
                    }
                }
                items.sort_by(|a, b| a.id.cmp(&b.id));
                Ok(items)
            }
        }
    }

    /// Application collections present in the local cache.
    pub async fn collections(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .cache
            .collections()
            .await?
            .into_iter()
            .filter(|c| !is_internal_collection(c))
            .collect())
    }

    /// Snapshot of local data as a plain envelope. `None` exports every
    /// application collection.
    pub async fn export_data(&self, collections: Option<&[String]>) -> Result<ExportEnvelope, StorageError> {
        let names = match collections {
            Some(names) => names.iter().filter(|c| !is_internal_collection(c)).cloned().collect(),
            None => self.collections().await?,
        };
        let mut out = BTreeMap::new();
        for name in names {
            let items = self.list(&name).await?;
            out.insert(name, items);
        }
        let envelope = ExportEnvelope {
            timestamp: now_millis(),
            version: EXPORT_VERSION,
            collections: out,
        };
        info!(items = envelope.item_count(), "Exported local data");
        Ok(envelope)
    }

    /// Import a plain envelope, validating shape and every item checksum.
    ///
    /// The envelope must have a `collections` object whose values are
    /// arrays; otherwise nothing is written. Items that fail validation are
    /// listed in [`ImportReport::rejected`] and skipped.
    #[tracing::instrument(skip(self, raw))]
    pub async fn import_data(&self, raw: &Value, overwrite: bool) -> Result<ImportReport, StorageError> {
        let version = raw.get("version").and_then(Value::as_u64).unwrap_or(0);
        if version > u64::from(EXPORT_VERSION) {
            return Err(StorageError::Invalid(format!("unsupported export version {}", version)));
        }
        let collections = raw
            .get("collections")
            .and_then(Value::as_object)
            .ok_or_else(|| StorageError::Invalid("envelope has no 'collections' object".into()))?;
        if let Some((name, _)) = collections.iter().find(|(_, v)| !v.is_array()) {
            return Err(StorageError::Invalid(format!("collection '{}' is not a list", name)));
        }

        let mut report = ImportReport::default();
        for (name, value) in collections {
            if is_internal_collection(name) {
                continue;
            }
            for raw_item in value.as_array().map(Vec::as_slice).unwrap_or_default() {
                let item: StorageItem = match serde_json::from_value(raw_item.clone()) {
                    Ok(item) => item,
                    Err(e) => {
                        let id = raw_item.get("id").and_then(Value::as_str).unwrap_or("?");
                        warn!(collection = %name, id, error = %e, "Rejected malformed item");
                        report.rejected.push(item_key(name, id));
                        continue;
                    }
                };
                if item.collection != *name {
                    report.rejected.push(item_key(name, &item.id));
                    continue;
                }
                if let Err(e) = item.validate() {
                    warn!(collection = %name, id = %item.id, error = %e, "Rejected invalid item");
                    metrics::record_corruption(name);
                    report.rejected.push(item.key());
                    continue;
                }
                if !overwrite && matches!(self.cache.get_item(name, &item.id).await, Ok(Some(_))) {
                    report.skipped += 1;
                    continue;
                }
                match self.set(name, &item.id, item.data.clone()).await {
                    Ok(_) => report.imported += 1,
                    Err(_) => report.rejected.push(item.key()),
                }
            }
        }
        info!(
            imported = report.imported,
            skipped = report.skipped,
            rejected = report.rejected.len(),
            "Import finished"
        );
        Ok(report)
    }

    pub async fn storage_stats(&self) -> Result<StorageStats, StorageError> {
        let mut collections = BTreeMap::new();
        let mut total_items = 0;
        for name in self.collections().await? {
            let items = self.cache.list_items(&name).await?;
            let mut stats = CollectionStats { total: items.len(), ..Default::default() };
            for item in &items {
                match item.metadata.sync_status {
                    SyncStatus::Pending => stats.pending += 1,
                    SyncStatus::Conflict => stats.conflict += 1,
                    SyncStatus::Offline => stats.offline += 1,
                    SyncStatus::Synced => {}
                }
            }
            total_items += stats.total;
            collections.insert(name, stats);
        }
        let fallback_keys = self.fallback.keys().await.map(|k| k.len()).unwrap_or(0);
        Ok(StorageStats {
            collections,
            total_items,
            fallback_keys,
            remote_configured: self.has_remote(),
            circuit_open: self.circuit.is_open(),
            health: self.last_health(),
        })
    }

    /// Append to the cache error log. Never fails the caller.
    pub async fn log_error(&self, kind: &str, message: &str, context: Value) {
        let entry = ErrorLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            kind: kind.to_string(),
            message: message.to_string(),
            context,
        };
        if let Err(e) = self.cache.append_error(&entry).await {
            warn!(kind, error = %e, "Failed to persist error log entry");
        }
    }

    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogEntry>, StorageError> {
        self.cache.recent_errors(limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::config::StorageConfig;
    use crate::harness::FaultyRemote;
    use crate::storage::memory::{MemoryCache, MemoryFallback, MemoryRemoteStore};
    use crate::storage::traits::{CacheStore, FallbackStore, RemoteStore};

    fn stack() -> (StorageCore, Arc<MemoryRemoteStore>, Arc<MemoryCache>, Arc<MemoryFallback>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let cache = Arc::new(MemoryCache::new());
        let fallback = Arc::new(MemoryFallback::new());
        let core = StorageCore::new(
            StorageConfig::default(),
            Some(remote.clone()),
            cache.clone(),
            fallback.clone(),
        );
        (core, remote, cache, fallback)
    }

    #[tokio::test]
    async fn test_set_propagates_and_marks_synced() {
        let (core, remote, cache, fallback) = stack();
        let report = core.set("orders", "o1", json!({"total": 100})).await.unwrap();

        assert!(report.propagated());
        assert!(report.failures.is_empty());
        assert_eq!(remote.row("orders", "o1").unwrap().data, json!({"total": 100}));
        let cached = cache.get_item("orders", "o1").await.unwrap().unwrap();
        assert_eq!(cached.metadata.sync_status, SyncStatus::Synced);
        assert_eq!(cached.metadata.source, TierSource::Authoritative);
        assert!(fallback.is_empty());
    }

    fn slow_stack() -> (Arc<StorageCore>, Arc<FaultyRemote<MemoryRemoteStore>>, Arc<MemoryCache>) {
        let remote = Arc::new(FaultyRemote::new(MemoryRemoteStore::new()));
        remote.set_latency(Duration::from_millis(50));
        let cache = Arc::new(MemoryCache::new());
        let core = Arc::new(StorageCore::new(
            StorageConfig::default(),
            Some(remote.clone()),
            cache.clone(),
            Arc::new(MemoryFallback::new()),
        ));
        (core, remote, cache)
    }

    #[tokio::test]
    async fn test_interleaved_sets_keep_latest_revision() {
        let (core, remote, cache) = slow_stack();
        let first = tokio::spawn({
            let core = core.clone();
            async move { core.set("c", "k", json!({"v": "A"})).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = core.set("c", "k", json!({"v": "B"})).await.unwrap();
        first.await.unwrap().unwrap();

        assert!(second.propagated());
        let cached = cache.get_item("c", "k").await.unwrap().unwrap();
        assert_eq!(cached.data, json!({"v": "B"}));
        assert_eq!(cached.metadata.version, 2);
        assert_eq!(cached.metadata.sync_status, SyncStatus::Synced);
        assert_eq!(remote.inner().row("c", "k").unwrap().data, json!({"v": "B"}));
        assert_eq!(core.get("c", "k").await.unwrap(), Some(json!({"v": "B"})));
    }

    #[tokio::test]
    async fn test_mark_synced_leaves_newer_local_revision_pending() {
        let (core, _, cache) = slow_stack();
        let write = tokio::spawn({
            let core = core.clone();
            async move { core.set("c", "k", json!({"v": "A"})).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A revision that lands in the cache while the upsert is in flight
        let written = cache.get_item("c", "k").await.unwrap().unwrap();
        let newer = written.revise(json!({"v": "B"}));
        cache.put_item(&newer).await.unwrap();
        assert!(write.await.unwrap().unwrap().propagated());

        let cached = cache.get_item("c", "k").await.unwrap().unwrap();
        assert_eq!(cached.data, json!({"v": "B"}));
        assert_eq!(cached.metadata.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_set_bumps_version() {
        let (core, _, _, _) = stack();
        core.set("orders", "o1", json!({"total": 1})).await.unwrap();
        let report = core.set("orders", "o1", json!({"total": 2})).await.unwrap();

        assert_eq!(report.item.metadata.version, 2);
        assert!(report.item.metadata.updated_at >= report.item.metadata.created_at);
    }

    #[tokio::test]
    async fn test_offline_core_marks_items_offline() {
        let core = StorageCore::new(
            StorageConfig::default(),
            None,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryFallback::new()),
        );
        let report = core.set("orders", "o1", json!({"total": 1})).await.unwrap();

        assert_eq!(report.item.metadata.sync_status, SyncStatus::Offline);
        assert!(report.failures.is_empty());
        assert_eq!(core.read("orders", "o1").await.unwrap().served_by, Some(Tier::Cache));
    }

    #[tokio::test]
    async fn test_read_prefers_authoritative_and_fills_cache() {
        let (core, remote, cache, _) = stack();
        let item = StorageItem::new("users", "u1", json!({"name": "remote"}));
        remote.upsert("users", &RemoteRow::from_item(&item)).await.unwrap();

        let outcome = core.read("users", "u1").await.unwrap();
        assert_eq!(outcome.served_by, Some(Tier::Authoritative));
        assert_eq!(cache.get_item("users", "u1").await.unwrap().unwrap().data["name"], "remote");
    }

    #[tokio::test]
    async fn test_pending_local_wins_over_remote() {
        let (core, remote, cache, _) = stack();
        let local = StorageItem::new("users", "u1", json!({"name": "local"}));
        cache.put_item(&local).await.unwrap();
        let remote_item = StorageItem::new("users", "u1", json!({"name": "remote"}));
        remote.upsert("users", &RemoteRow::from_item(&remote_item)).await.unwrap();

        assert_eq!(core.get("users", "u1").await.unwrap().unwrap()["name"], "local");
    }

    #[tokio::test]
    async fn test_reserved_collection_rejected() {
        let (core, _, _, _) = stack();
        assert!(matches!(core.set("_sync_queue", "x", json!({})).await, Err(StorageError::Invalid(_))));
        assert!(matches!(core.set("orders", "", json!({})).await, Err(StorageError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let (core, remote, cache, _) = stack();
        core.set("orders", "o1", json!({"total": 1})).await.unwrap();

        let report = core.delete("orders", "o1").await.unwrap();
        assert!(report.existed);
        assert!(remote.row("orders", "o1").is_none());
        assert!(cache.get_item("orders", "o1").await.unwrap().is_none());
        assert_eq!(core.get("orders", "o1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Order {
            total: u32,
        }
        let (core, _, _, _) = stack();
        core.set_as("orders", "o1", &Order { total: 7 }).await.unwrap();
        assert_eq!(core.get_as::<Order>("orders", "o1").await.unwrap(), Some(Order { total: 7 }));
    }

    #[tokio::test]
    async fn test_export_import_roundtrip() {
        let (core, _, _, _) = stack();
        core.set("orders", "o1", json!({"total": 1})).await.unwrap();
        core.set("users", "u1", json!({"name": "a"})).await.unwrap();

        let envelope = core.export_data(None).await.unwrap();
        assert_eq!(envelope.item_count(), 2);
        let raw = serde_json::to_value(&envelope).unwrap();

        let (other, _, _, _) = stack();
        let report = other.import_data(&raw, false).await.unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(other.get("users", "u1").await.unwrap(), Some(json!({"name": "a"})));

        let again = other.import_data(&raw, false).await.unwrap();
        assert_eq!(again.skipped, 2);
    }

    #[tokio::test]
    async fn test_import_rejects_tampered_item_and_bad_shape() {
        let (core, _, _, _) = stack();
        let mut item = StorageItem::new("orders", "o1", json!({"total": 1}));
        item.data = json!({"total": 999});
        let raw = json!({"timestamp": 0, "version": 1, "collections": {"orders": [item]}});

        let report = core.import_data(&raw, true).await.unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.rejected, vec!["orders:o1"]);

        let bad = json!({"version": 1, "collections": {"orders": {"o1": {}}}});
        assert!(core.import_data(&bad, true).await.is_err());
        assert_eq!(core.get("orders", "o1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stats_and_error_log() {
        let (core, _, _, _) = stack();
        core.set("orders", "o1", json!({"total": 1})).await.unwrap();
        core.log_error("sync", "push failed", json!({"id": "o1"})).await;

        let stats = core.storage_stats().await.unwrap();
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.collections["orders"].pending, 0);
        assert!(stats.remote_configured);

        let errors = core.recent_errors(10).await.unwrap();
        assert_eq!(errors[0].kind, "sync");
    }

    #[tokio::test]
    async fn test_list_falls_back_to_fallback_keys() {
        let fallback = Arc::new(MemoryFallback::new());
        let item = StorageItem::new("orders", "o1", json!({}));
        fallback.put(&item.key(), &serde_json::to_vec(&item).unwrap()).await.unwrap();

        let core = StorageCore::new(
            StorageConfig::default(),
            None,
            Arc::new(crate::harness::BrokenCache),
            fallback,
        );
        let items = core.list("orders").await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(core.read("orders", "o1").await.unwrap().served_by == Some(Tier::Fallback));
    }

    #[tokio::test]
    async fn test_remote_ping_available_through_trait_object() {
        let (_, remote, _, _) = stack();
        let dyn_remote: Arc<dyn RemoteStore> = remote;
        assert!(dyn_remote.ping().await.is_ok());
    }
}
