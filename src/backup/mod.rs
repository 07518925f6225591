// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backup manager: point-in-time snapshots, retention and restore.
//!
//! # Create pipeline
//!
//! ```text
//! in_progress ─▶ collect (authoritative ∪ cache, later updated_at wins)
//!             ─▶ serialize ─▶ compress? ─▶ encrypt? ─▶ checksum(final bytes)
//!             ─▶ store blob + completed metadata together
//!             ─▶ completed | failed(error)
//! ```
//!
//! A failed step never leaves a completed backup behind, and nothing is
//! retried automatically. Automatic backups beyond the configured maximum
//! are pruned oldest-first after each successful automatic backup.
//!
//! Restores validate the whole snapshot before the first write.

pub mod codec;
pub mod types;

pub use types::{
    BackupDestination, BackupError, BackupFile, BackupMetadata, BackupPayload, BackupRecord,
    BackupRequest, BackupStatus, BackupType, CollectionRestore, RestoreOptions, RestoreReport,
    BACKUP_FILE_VERSION,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compression::CompressionStats;
use crate::config::BackupConfig;
use crate::core::StorageCore;
use crate::crypto::BackupCipher;
use crate::metrics;
use crate::storage::traits::{RowFilter, StorageError};
use crate::storage_item::{is_internal_collection, now_millis, StorageItem};

pub struct BackupManager {
    core: Arc<StorageCore>,
    config: BackupConfig,
    cipher: Option<BackupCipher>,
    /// One backup or restore job at a time
    job_lock: Mutex<()>,
}

impl BackupManager {
    /// Fails only on a malformed encryption key. A missing key is allowed
    /// here and reported by each backup that asks for encryption.
    pub fn new(core: Arc<StorageCore>, config: BackupConfig) -> Result<Self, BackupError> {
        let cipher = match config.encryption_key.as_deref() {
            Some(key) => Some(BackupCipher::from_hex(key)?),
            None => None,
        };
        Ok(Self {
            core,
            config,
            cipher,
            job_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    async fn resolve_collections(&self, requested: &[String]) -> Result<Vec<String>, StorageError> {
        let source = if !requested.is_empty() {
            requested.to_vec()
        } else if !self.config.collections.is_empty() {
            self.config.collections.clone()
        } else {
            self.core.collections().await?
        };
        let mut collections: Vec<String> = source.into_iter().filter(|c| !is_internal_collection(c)).collect();
        collections.sort();
        collections.dedup();
        Ok(collections)
    }

    /// Items of one collection from both tiers, deduplicated by id with the
    /// later `updated_at` winning. An unreachable authoritative tier is
    /// skipped so backups still work during an outage.
    async fn collect(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        let mut merged: BTreeMap<String, StorageItem> = BTreeMap::new();
        for item in self.core.list(collection).await? {
            merged.insert(item.id.clone(), item);
        }
        if self.core.has_remote() {
            match self.core.remote_select(collection, RowFilter::All).await {
                Ok(rows) => {
                    for remote in rows {
                        match merged.get(&remote.id) {
                            Some(local) if !remote.is_newer_than(local) => {}
                            _ => {
                                merged.insert(remote.id.clone(), remote);
                            }
                        }
                    }
                }
                Err(e) => warn!(collection, error = %e, "Authoritative tier unavailable, backing up local copy only"),
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn build(&self, metadata: &BackupMetadata) -> Result<BackupRecord, BackupError> {
        let mut collections = BTreeMap::new();
        for name in &metadata.collections {
            collections.insert(name.clone(), self.collect(name).await?);
        }
        let payload = BackupPayload { created_at: metadata.created_at, collections };
        let item_count = payload.collections.values().map(Vec::len).sum::<usize>() as u64;

        let blob = codec::encode(&payload, self.config.compress, self.config.encrypt, self.cipher.as_ref())?;
        let checksum = codec::blob_checksum(&blob.bytes);

        let mut completed = metadata.clone();
        completed.compressed = blob.compressed;
        completed.encrypted = blob.encrypted;
        completed.item_count = item_count;
        completed.mark_completed(blob.bytes.len() as u64, checksum)?;
        let stats = CompressionStats::new(blob.raw_size, blob.bytes.len());
        debug!(
            backup_id = %completed.id,
            raw_bytes = stats.original_bytes,
            stored_bytes = stats.compressed_bytes,
            savings = format!("{:.1}%", stats.savings * 100.0),
            "Snapshot encoded"
        );
        Ok(BackupRecord { metadata: completed, blob: blob.bytes })
    }

    /// Run the create pipeline. The returned metadata is `completed` or
    /// `failed` with the causing error; nothing is retried.
    #[tracing::instrument(skip(self, request), fields(name = %request.name, backup_type = %request.backup_type))]
    pub async fn create_backup(&self, request: BackupRequest) -> BackupMetadata {
        let _job = self.job_lock.lock().await;
        let id = request.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let collections = match self.resolve_collections(&request.collections).await {
            Ok(collections) => collections,
            Err(e) => {
                warn!(error = %e, "Could not resolve backup collections");
                request.collections.clone()
            }
        };
        let mut metadata = BackupMetadata::in_progress(
            id,
            request.name,
            request.description,
            request.backup_type,
            collections,
        );
        metadata.destination = self.config.destination;

        let outcome = match self.core.save_backup_metadata(&metadata).await {
            Ok(()) => match self.build(&metadata).await {
                Ok(record) => self.core.store_backup(&record).await.map(|()| record.metadata).map_err(BackupError::from),
                Err(e) => Err(e),
            },
            Err(e) => Err(e.into()),
        };

        let backup_type = metadata.backup_type;
        let result = match outcome {
            Ok(completed) => {
                metrics::record_backup(&backup_type.to_string(), "completed");
                metrics::record_backup_bytes(completed.size);
                info!(
                    backup_id = %completed.id,
                    items = completed.item_count,
                    size = completed.size,
                    compressed = completed.compressed,
                    encrypted = completed.encrypted,
                    "Backup completed"
                );
                completed
            }
            Err(e) => {
                error!(backup_id = %metadata.id, error = %e, "Backup failed");
                metrics::record_backup(&backup_type.to_string(), "failed");
                if let Err(transition) = metadata.mark_failed(e.to_string()) {
                    warn!(error = %transition, "Backup status already final");
                }
                if let Err(save) = self.core.save_backup_metadata(&metadata).await {
                    warn!(backup_id = %metadata.id, error = %save, "Could not record failed backup");
                }
                metadata
            }
        };
        drop(_job);

        if result.status == BackupStatus::Completed && backup_type == BackupType::Automatic {
            if let Err(e) = self.prune_automatic().await {
                warn!(error = %e, "Retention pruning failed");
            }
        }
        result
    }

    pub async fn create_manual_backup(&self, name: &str, description: Option<&str>) -> BackupMetadata {
        self.create_backup(BackupRequest {
            id: None,
            name: name.to_string(),
            description: description.map(str::to_string),
            backup_type: BackupType::Manual,
            collections: Vec::new(),
        })
        .await
    }

    /// Snapshot taken at the moment a failure is detected.
    pub async fn create_emergency_backup(&self, reason: &str) -> BackupMetadata {
        self.create_backup(BackupRequest {
            id: None,
            name: format!("emergency-{}", now_millis()),
            description: Some(reason.to_string()),
            backup_type: BackupType::Emergency,
            collections: Vec::new(),
        })
        .await
    }

    pub async fn create_automatic_backup(&self) -> BackupMetadata {
        self.create_backup(BackupRequest {
            id: None,
            name: format!("auto-{}", now_millis()),
            description: None,
            backup_type: BackupType::Automatic,
            collections: Vec::new(),
        })
        .await
    }

    /// All backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        Ok(self.core.backup_index().await?)
    }

    pub async fn get_backup(&self, id: &str) -> Result<Option<BackupMetadata>, BackupError> {
        Ok(self.list_backups().await?.into_iter().find(|m| m.id == id))
    }

    pub async fn delete_backup(&self, id: &str) -> Result<bool, BackupError> {
        let removed = self.core.remove_backup(id).await?;
        if removed {
            info!(backup_id = id, "Backup deleted");
        }
        Ok(removed)
    }

    /// Newest completed backup covering every collection in `collections`.
    pub async fn latest_completed(&self, collections: &[String]) -> Result<Option<BackupMetadata>, BackupError> {
        Ok(self
            .list_backups()
            .await?
            .into_iter()
            .find(|m| m.status == BackupStatus::Completed && m.covers(collections)))
    }

    /// Delete automatic backups beyond the configured maximum, oldest first.
    pub async fn prune_automatic(&self) -> Result<usize, BackupError> {
        let mut automatic: Vec<BackupMetadata> = self
            .list_backups()
            .await?
            .into_iter()
            .filter(|m| m.backup_type == BackupType::Automatic)
            .collect();
        automatic.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut pruned = 0;
        for stale in automatic.iter().skip(self.config.max_automatic_backups) {
            if self.core.remove_backup(&stale.id).await? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, keep = self.config.max_automatic_backups, "Pruned automatic backups");
        }
        Ok(pruned)
    }

    /// Check status and checksum, then decode. Nothing is written.
    fn verify(&self, record: &BackupRecord, validate_data: bool) -> Result<BackupPayload, BackupError> {
        let meta = &record.metadata;
        if meta.status != BackupStatus::Completed {
            return Err(BackupError::NotRestorable { id: meta.id.clone(), status: meta.status });
        }
        if validate_data {
            let actual = codec::blob_checksum(&record.blob);
            if actual != meta.checksum {
                return Err(BackupError::Corrupted {
                    id: meta.id.clone(),
                    reason: format!("checksum mismatch: expected {}, got {}", meta.checksum, actual),
                });
            }
        }
        let payload = codec::decode(&record.blob, meta.compressed, meta.encrypted, self.cipher.as_ref())?;
        if validate_data {
            for (name, items) in &payload.collections {
                for item in items {
                    if item.collection != *name {
                        return Err(BackupError::Corrupted {
                            id: meta.id.clone(),
                            reason: format!("item '{}' filed under '{}'", item.key(), name),
                        });
                    }
                    item.validate().map_err(|e| BackupError::Corrupted {
                        id: meta.id.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(payload)
    }

    /// Restore a backup through the storage core.
    #[tracing::instrument(skip(self, options))]
    pub async fn restore_backup(&self, id: &str, options: RestoreOptions) -> Result<RestoreReport, BackupError> {
        let _job = self.job_lock.lock().await;
        let record = self
            .core
            .load_backup(id)
            .await
            .map_err(|e| match e {
                StorageError::NotFound => BackupError::NotFound(id.to_string()),
                other => other.into(),
            })?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;

        let payload = match self.verify(&record, options.validate_data) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(backup_id = id, error = %e, "Backup rejected");
                metrics::record_restore("rejected", 0);
                return Err(e);
            }
        };

        let targets: Vec<String> = match &options.collections {
            Some(wanted) => {
                if let Some(missing) = wanted.iter().find(|c| !payload.collections.contains_key(*c)) {
                    return Err(BackupError::InvalidFormat(format!(
                        "backup '{}' has no collection '{}'",
                        id, missing
                    )));
                }
                wanted.clone()
            }
            None => payload.collections.keys().cloned().collect(),
        };

        let mut report = RestoreReport {
            backup_id: id.to_string(),
            dry_run: options.dry_run,
            collections: BTreeMap::new(),
        };
        for name in &targets {
            let items = payload.collections.get(name).map(Vec::as_slice).unwrap_or_default();
            let mut counts = CollectionRestore { total: items.len(), ..Default::default() };
            if !options.dry_run {
                for item in items {
                    if !options.overwrite {
                        if let Ok(Some(_)) = self.core.local_item(name, &item.id).await {
                            counts.skipped += 1;
                            continue;
                        }
                    }
                    match self.core.set(name, &item.id, item.data.clone()).await {
                        Ok(_) => counts.restored += 1,
                        Err(e) => {
                            warn!(collection = %name, id = %item.id, error = %e, "Item not restored");
                            counts.failed += 1;
                        }
                    }
                }
            }
            report.collections.insert(name.clone(), counts);
        }

        metrics::record_restore(if options.dry_run { "dry_run" } else { "completed" }, report.restored());
        info!(
            backup_id = id,
            dry_run = options.dry_run,
            total = report.total(),
            restored = report.restored(),
            failed = report.failed(),
            "Restore finished"
        );
        Ok(report)
    }

    /// Wrap a stored backup, blob still encoded, for download.
    pub async fn export_backup(&self, id: &str) -> Result<BackupFile, BackupError> {
        let record = self
            .core
            .load_backup(id)
            .await?
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        Ok(BackupFile {
            metadata: record.metadata,
            data: record.blob,
            exported_at: now_millis(),
            version: BACKUP_FILE_VERSION,
        })
    }

    /// Validate an uploaded backup exactly like a restore would, then store
    /// it locally. An id clash gets a fresh id.
    #[tracing::instrument(skip(self, file), fields(backup_id = %file.metadata.id))]
    pub async fn import_backup(&self, file: BackupFile) -> Result<BackupMetadata, BackupError> {
        if file.version > BACKUP_FILE_VERSION {
            return Err(BackupError::InvalidFormat(format!("unsupported backup file version {}", file.version)));
        }
        let mut record = BackupRecord { metadata: file.metadata, blob: file.data };
        self.verify(&record, true)?;

        if self.get_backup(&record.metadata.id).await?.is_some() {
            let fresh = uuid::Uuid::new_v4().to_string();
            debug!(old = %record.metadata.id, new = %fresh, "Imported backup id already taken");
            record.metadata.id = fresh;
        }
        record.metadata.destination = BackupDestination::LocalCache;
        self.core.store_backup(&record).await?;
        info!(backup_id = %record.metadata.id, "Backup imported");
        Ok(record.metadata)
    }

    pub async fn export_backup_to_file(&self, id: &str, path: impl AsRef<Path>) -> Result<BackupFile, BackupError> {
        let file = self.export_backup(id).await?;
        tokio::fs::write(path.as_ref(), serde_json::to_vec_pretty(&file)?).await?;
        info!(backup_id = id, path = %path.as_ref().display(), "Backup exported to file");
        Ok(file)
    }

    pub async fn import_backup_from_file(&self, path: impl AsRef<Path>) -> Result<BackupMetadata, BackupError> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let file: BackupFile = serde_json::from_slice(&bytes)?;
        self.import_backup(file).await
    }

    /// Take automatic backups on the configured interval until cancelled.
    pub async fn run_scheduler(&self, cancel: CancellationToken) {
        if self.config.auto_backup_interval_secs == 0 {
            debug!("Automatic backups disabled");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.auto_backup_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.create_automatic_backup().await;
                }
            }
        }
        debug!("Backup scheduler stopped");
    }
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("destination", &self.config.destination)
            .field("compress", &self.config.compress)
            .field("encrypt", &self.config.encrypt)
            .finish_non_exhaustive()
    }
}
