// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backends over the sqlx `Any` driver.
//!
//! - [`SqlCache`]: the durable local cache (normally a SQLite file)
//! - [`SqlRemoteStore`]: an authoritative tier backed by MySQL or SQLite
//!
//! Cache schema, one table per logical store:
//! ```sql
//! CREATE TABLE cache_items (
//!   collection TEXT, id TEXT,
//!   sync_status TEXT,       -- indexed for the reconciliation sweep
//!   updated_at INTEGER,
//!   item TEXT,              -- full StorageItem as JSON
//!   PRIMARY KEY (collection, id)
//! );
//! CREATE TABLE sync_metadata (collection TEXT PRIMARY KEY, last_sync INTEGER);
//! CREATE TABLE backups (id TEXT PRIMARY KEY, created_at INTEGER, metadata TEXT, payload BLOB);
//! CREATE TABLE error_log (id TEXT PRIMARY KEY, timestamp INTEGER, kind TEXT, message TEXT, context TEXT);
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON lives in TEXT columns because `Any` has no JSON type mapping, and
//! MySQL LONGTEXT comes back as bytes, so every text read tries `String`
//! first and falls back to `Vec<u8>`.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::memory::ERROR_LOG_CAP;
use super::traits::{
    CacheStore, ChangeEvent, ChangeKind, ErrorLogEntry, RemoteRow, RemoteStore, RowFilter,
    StorageError,
};
use crate::backup::types::{BackupMetadata, BackupRecord};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage_item::{StorageItem, SyncStatus};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

fn backend(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column as `String` (SQLite) or bytes (MySQL LONGTEXT).
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| backend(format!("missing column '{}'", column)))
}

async fn connect(url: &str) -> Result<(AnyPool, bool), StorageError> {
    install_drivers();
    let is_sqlite = url.starts_with("sqlite:");
    // Every connection to an in-memory SQLite database sees its own database
    let max_connections = if url.contains(":memory:") { 1 } else { 20 };

    let pool = retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(url)
            .await
            .map_err(backend)
    })
    .await?;

    if is_sqlite {
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            sqlx::query(pragma)
                .execute(&pool)
                .await
                .map_err(|e| backend(format!("{} failed: {}", pragma, e)))?;
        }
    }
    Ok((pool, is_sqlite))
}

async fn run_schema(pool: &AnyPool, statements: &[&str]) -> Result<(), StorageError> {
    for sql in statements {
        retry("sql_init_schema", &RetryConfig::startup(), || async {
            sqlx::query(sql).execute(pool).await.map_err(backend)
        })
        .await?;
    }
    Ok(())
}

const SQLITE_CACHE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_items (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        item TEXT NOT NULL,
        PRIMARY KEY (collection, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_cache_items_status ON cache_items (collection, sync_status)",
    "CREATE TABLE IF NOT EXISTS sync_metadata (
        collection TEXT PRIMARY KEY,
        last_sync INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS backups (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        metadata TEXT NOT NULL,
        payload BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS error_log (
        id TEXT PRIMARY KEY,
        timestamp INTEGER NOT NULL,
        kind TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT
    )",
];

const MYSQL_CACHE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_items (
        collection VARCHAR(191) NOT NULL,
        id VARCHAR(191) NOT NULL,
        sync_status VARCHAR(16) NOT NULL,
        updated_at BIGINT NOT NULL,
        item LONGTEXT NOT NULL,
        PRIMARY KEY (collection, id),
        INDEX idx_cache_items_status (collection, sync_status)
    )",
    "CREATE TABLE IF NOT EXISTS sync_metadata (
        collection VARCHAR(191) PRIMARY KEY,
        last_sync BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS backups (
        id VARCHAR(191) PRIMARY KEY,
        created_at BIGINT NOT NULL,
        metadata LONGTEXT NOT NULL,
        payload LONGBLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS error_log (
        id VARCHAR(191) PRIMARY KEY,
        timestamp BIGINT NOT NULL,
        kind VARCHAR(64) NOT NULL,
        message TEXT NOT NULL,
        context TEXT
    )",
];

/// Durable local cache over SQL.
pub struct SqlCache {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlCache {
    /// Connect with startup-mode retry (fails fast if the URL is wrong).
    pub async fn open(url: &str) -> Result<Self, StorageError> {
        let (pool, is_sqlite) = connect(url).await?;
        let schema = if is_sqlite { SQLITE_CACHE_SCHEMA } else { MYSQL_CACHE_SCHEMA };
        run_schema(&pool, schema).await?;
        debug!(sqlite = is_sqlite, "Local cache schema ready");
        Ok(Self { pool, is_sqlite })
    }

    /// Open (creating if needed) a SQLite cache file.
    pub async fn open_file(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        Self::open(&format!("sqlite://{}?mode=rwc", path.as_ref().display())).await
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    fn upsert_sql(&self, table: &str, key: &str, columns: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let non_key: Vec<&&str> = columns.iter().filter(|c| !key.split(',').any(|k| k.trim() == **c)).collect();
        let updates = if self.is_sqlite {
            non_key.iter().map(|c| format!("{c} = excluded.{c}")).collect::<Vec<_>>().join(", ")
        } else {
            non_key.iter().map(|c| format!("{c} = VALUES({c})")).collect::<Vec<_>>().join(", ")
        };
        if self.is_sqlite {
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT({key}) DO UPDATE SET {updates}",
                columns.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {table} ({}) VALUES ({placeholders}) ON DUPLICATE KEY UPDATE {updates}",
                columns.join(", ")
            )
        }
    }

    fn decode_item(row: &AnyRow) -> Result<StorageItem, StorageError> {
        Ok(serde_json::from_str(&required_text(row, "item")?)?)
    }

    async fn fetch_items(&self, sql: &str, binds: &[&str]) -> Result<Vec<StorageItem>, StorageError> {
        let mut query = sqlx::query(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;
        rows.iter().map(Self::decode_item).collect()
    }

    async fn trim_error_log(&self) -> Result<(), StorageError> {
        let cutoff = sqlx::query("SELECT timestamp FROM error_log ORDER BY timestamp DESC LIMIT 1 OFFSET ?")
            .bind(ERROR_LOG_CAP as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        if let Some(row) = cutoff {
            let ts: i64 = row.try_get("timestamp").map_err(backend)?;
            sqlx::query("DELETE FROM error_log WHERE timestamp <= ?")
                .bind(ts)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqlCache {
    async fn get_item(&self, collection: &str, id: &str) -> Result<Option<StorageItem>, StorageError> {
        let row = sqlx::query("SELECT item FROM cache_items WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(Self::decode_item).transpose()
    }

    async fn put_item(&self, item: &StorageItem) -> Result<(), StorageError> {
        let sql = self.upsert_sql(
            "cache_items",
            "collection, id",
            &["collection", "id", "sync_status", "updated_at", "item"],
        );
        let json = serde_json::to_string(item)?;
        retry("sql_cache_put", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&item.collection)
                .bind(&item.id)
                .bind(item.metadata.sync_status.as_str())
                .bind(item.metadata.updated_at)
                .bind(&json)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn delete_item(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM cache_items WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_items(&self, collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        self.fetch_items("SELECT item FROM cache_items WHERE collection = ? ORDER BY id", &[collection])
            .await
    }

    async fn list_by_status(&self, collection: &str, status: SyncStatus) -> Result<Vec<StorageItem>, StorageError> {
        self.fetch_items(
            "SELECT item FROM cache_items WHERE collection = ? AND sync_status = ? ORDER BY id",
            &[collection, status.as_str()],
        )
        .await
    }

    async fn collections(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT collection FROM cache_items ORDER BY collection")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(|r| required_text(r, "collection")).collect()
    }

    async fn count_items(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM cache_items")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }

    async fn last_sync(&self, collection: &str) -> Result<Option<i64>, StorageError> {
        let row = sqlx::query("SELECT last_sync FROM sync_metadata WHERE collection = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.map(|r| r.try_get::<i64, _>("last_sync").map_err(backend)).transpose()
    }

    async fn set_last_sync(&self, collection: &str, timestamp: i64) -> Result<(), StorageError> {
        let sql = self.upsert_sql("sync_metadata", "collection", &["collection", "last_sync"]);
        sqlx::query(&sql)
            .bind(collection)
            .bind(timestamp)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn put_backup(&self, record: &BackupRecord) -> Result<(), StorageError> {
        let sql = self.upsert_sql("backups", "id", &["id", "created_at", "metadata", "payload"]);
        let metadata = serde_json::to_string(&record.metadata)?;
        retry("sql_backup_put", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&record.metadata.id)
                .bind(record.metadata.created_at)
                .bind(&metadata)
                .bind(&record.blob)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(())
        })
        .await
    }

    async fn get_backup(&self, id: &str) -> Result<Option<BackupRecord>, StorageError> {
        let row = sqlx::query("SELECT metadata, payload FROM backups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        match row {
            Some(row) => {
                let metadata: BackupMetadata = serde_json::from_str(&required_text(&row, "metadata")?)?;
                let blob: Vec<u8> = row.try_get("payload").map_err(backend)?;
                Ok(Some(BackupRecord { metadata, blob }))
            }
            None => Ok(None),
        }
    }

    async fn list_backups(&self) -> Result<Vec<BackupMetadata>, StorageError> {
        let rows = sqlx::query("SELECT metadata FROM backups ORDER BY created_at DESC, id DESC")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|r| -> Result<BackupMetadata, StorageError> {
                Ok(serde_json::from_str(&required_text(r, "metadata")?)?)
            })
            .collect()
    }

    async fn delete_backup(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM backups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_error(&self, entry: &ErrorLogEntry) -> Result<(), StorageError> {
        let context = serde_json::to_string(&entry.context)?;
        sqlx::query("INSERT INTO error_log (id, timestamp, kind, message, context) VALUES (?, ?, ?, ?, ?)")
            .bind(&entry.id)
            .bind(entry.timestamp)
            .bind(&entry.kind)
            .bind(&entry.message)
            .bind(&context)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if let Err(e) = self.trim_error_log().await {
            warn!(error = %e, "Failed to trim error log");
        }
        Ok(())
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<ErrorLogEntry>, StorageError> {
        let limit = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query("SELECT id, timestamp, kind, message, context FROM error_log ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|r| -> Result<ErrorLogEntry, StorageError> {
                Ok(ErrorLogEntry {
                    id: required_text(r, "id")?,
                    timestamp: r.try_get("timestamp").map_err(backend)?,
                    kind: required_text(r, "kind")?,
                    message: required_text(r, "message")?,
                    context: text(r, "context")
                        .and_then(|c| serde_json::from_str(&c).ok())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}

const SQLITE_REMOTE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS storage_rows (
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        data TEXT NOT NULL,
        metadata TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (collection, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_storage_rows_updated ON storage_rows (collection, updated_at)",
];

const MYSQL_REMOTE_SCHEMA: &[&str] = &["CREATE TABLE IF NOT EXISTS storage_rows (
        collection VARCHAR(191) NOT NULL,
        id VARCHAR(191) NOT NULL,
        data LONGTEXT NOT NULL,
        metadata TEXT NOT NULL,
        updated_at BIGINT NOT NULL,
        PRIMARY KEY (collection, id),
        INDEX idx_storage_rows_updated (collection, updated_at)
    )"];

/// Authoritative tier over SQL.
///
/// Calls are not retried here: the storage core bounds each call with a
/// timeout and a circuit breaker, and the sync queue owns retries.
///
/// The change feed only carries writes made through this handle; other
/// writers to the same database are picked up by the batch sweep.
pub struct SqlRemoteStore {
    pool: AnyPool,
    is_sqlite: bool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqlRemoteStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let (pool, is_sqlite) = connect(url).await?;
        let schema = if is_sqlite { SQLITE_REMOTE_SCHEMA } else { MYSQL_REMOTE_SCHEMA };
        run_schema(&pool, schema).await?;
        let (changes, _) = broadcast::channel(1024);
        Ok(Self { pool, is_sqlite, changes })
    }

    fn where_clause(filter: &RowFilter) -> &'static str {
        match filter {
            RowFilter::All => "WHERE collection = ?",
            RowFilter::Id(_) => "WHERE collection = ? AND id = ?",
            RowFilter::UpdatedSince(_) => "WHERE collection = ? AND updated_at >= ?",
        }
    }

    fn bind_filter<'q>(
        query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
        collection: &'q str,
        filter: &'q RowFilter,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        let query = query.bind(collection);
        match filter {
            RowFilter::All => query,
            RowFilter::Id(id) => query.bind(id.as_str()),
            RowFilter::UpdatedSince(since) => query.bind(*since),
        }
    }

    fn decode_row(row: &AnyRow) -> Result<RemoteRow, StorageError> {
        Ok(RemoteRow {
            id: required_text(row, "id")?,
            data: serde_json::from_str(&required_text(row, "data")?)?,
            metadata: serde_json::from_str(&required_text(row, "metadata")?)?,
            updated_at: row.try_get("updated_at").map_err(backend)?,
        })
    }

    fn emit(&self, collection: &str, event_type: ChangeKind, new: Option<RemoteRow>, old: Option<RemoteRow>) {
        let _ = self.changes.send(ChangeEvent {
            table: collection.to_string(),
            event_type,
            new,
            old,
        });
    }
}

#[async_trait]
impl RemoteStore for SqlRemoteStore {
    async fn select(&self, collection: &str, filter: &RowFilter) -> Result<Vec<RemoteRow>, StorageError> {
        let sql = format!(
            "SELECT id, data, metadata, updated_at FROM storage_rows {} ORDER BY id",
            Self::where_clause(filter)
        );
        let rows = Self::bind_filter(sqlx::query(&sql), collection, filter)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn insert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO storage_rows (collection, id, data, metadata, updated_at) VALUES (?, ?, ?, ?, ?)")
            .bind(collection)
            .bind(&row.id)
            .bind(serde_json::to_string(&row.data)?)
            .bind(serde_json::to_string(&row.metadata)?)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        self.emit(collection, ChangeKind::Insert, Some(row.clone()), None);
        Ok(())
    }

    async fn update(&self, collection: &str, filter: &RowFilter, patch: &RemoteRow) -> Result<u64, StorageError> {
        let before = self.select(collection, filter).await?;
        let sql = format!(
            "UPDATE storage_rows SET data = ?, metadata = ?, updated_at = ? {}",
            Self::where_clause(filter)
        );
        let data = serde_json::to_string(&patch.data)?;
        let metadata = serde_json::to_string(&patch.metadata)?;
        let query = sqlx::query(&sql).bind(data).bind(metadata).bind(patch.updated_at);
        let result = Self::bind_filter(query, collection, filter)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        for old in before {
            let new = RemoteRow {
                id: old.id.clone(),
                data: patch.data.clone(),
                metadata: patch.metadata.clone(),
                updated_at: patch.updated_at,
            };
            self.emit(collection, ChangeKind::Update, Some(new), Some(old));
        }
        Ok(result.rows_affected())
    }

    async fn delete(&self, collection: &str, filter: &RowFilter) -> Result<u64, StorageError> {
        let before = self.select(collection, filter).await?;
        let sql = format!("DELETE FROM storage_rows {}", Self::where_clause(filter));
        let result = Self::bind_filter(sqlx::query(&sql), collection, filter)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        for old in before {
            self.emit(collection, ChangeKind::Delete, None, Some(old));
        }
        Ok(result.rows_affected())
    }

    async fn upsert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        let old = self
            .select(collection, &RowFilter::Id(row.id.clone()))
            .await?
            .into_iter()
            .next();
        let sql = if self.is_sqlite {
            "INSERT INTO storage_rows (collection, id, data, metadata, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                data = excluded.data,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at"
        } else {
            "INSERT INTO storage_rows (collection, id, data, metadata, updated_at) VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                data = VALUES(data),
                metadata = VALUES(metadata),
                updated_at = VALUES(updated_at)"
        };
        sqlx::query(sql)
            .bind(collection)
            .bind(&row.id)
            .bind(serde_json::to_string(&row.data)?)
            .bind(serde_json::to_string(&row.metadata)?)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        let kind = if old.is_some() { ChangeKind::Update } else { ChangeKind::Insert };
        self.emit(collection, kind, Some(row.clone()), old);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        Some(self.changes.subscribe())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::BackupType;
    use serde_json::json;
    use tempfile::TempDir;

    async fn temp_cache() -> (TempDir, SqlCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqlCache::open_file(dir.path().join("cache.db")).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_cache_item_roundtrip_and_status_index() {
        let (_dir, cache) = temp_cache().await;
        let item = StorageItem::new("orders", "o1", json!({"total": 10}));
        cache.put_item(&item).await.unwrap();

        assert_eq!(cache.get_item("orders", "o1").await.unwrap().unwrap(), item);
        assert_eq!(cache.list_by_status("orders", SyncStatus::Pending).await.unwrap().len(), 1);

        let synced = item.with_status(SyncStatus::Synced, crate::TierSource::Authoritative);
        cache.put_item(&synced).await.unwrap();
        assert!(cache.list_by_status("orders", SyncStatus::Pending).await.unwrap().is_empty());
        assert_eq!(cache.count_items().await.unwrap(), 1);
        assert_eq!(cache.collections().await.unwrap(), vec!["orders"]);
    }

    #[tokio::test]
    async fn test_cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = SqlCache::open_file(&path).await.unwrap();
            cache.put_item(&StorageItem::new("orders", "o1", json!({}))).await.unwrap();
            cache.set_last_sync("orders", 42).await.unwrap();
        }
        let cache = SqlCache::open_file(&path).await.unwrap();
        assert!(cache.get_item("orders", "o1").await.unwrap().is_some());
        assert_eq!(cache.last_sync("orders").await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_cache_backup_store() {
        let (_dir, cache) = temp_cache().await;
        let metadata = BackupMetadata::in_progress("b1".into(), "n".into(), None, BackupType::Manual, vec![]);
        let record = BackupRecord { metadata, blob: vec![1, 2, 3] };
        cache.put_backup(&record).await.unwrap();

        assert_eq!(cache.get_backup("b1").await.unwrap().unwrap(), record);
        assert_eq!(cache.list_backups().await.unwrap().len(), 1);
        assert!(cache.delete_backup("b1").await.unwrap());
        assert!(cache.get_backup("b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_error_log() {
        let (_dir, cache) = temp_cache().await;
        for i in 0..3 {
            cache
                .append_error(&ErrorLogEntry {
                    id: format!("e{}", i),
                    timestamp: i,
                    kind: "sync".into(),
                    message: "failed".into(),
                    context: json!({"attempt": i}),
                })
                .await
                .unwrap();
        }
        let recent = cache.recent_errors(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, "e2");
        assert_eq!(recent[0].context["attempt"], 2);
    }

    #[tokio::test]
    async fn test_remote_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("remote.db").display());
        let remote = SqlRemoteStore::connect(&url).await.unwrap();
        let mut feed = remote.subscribe().unwrap();

        let row = RemoteRow::from_item(&StorageItem::new("orders", "o1", json!({"total": 1})));
        remote.upsert("orders", &row).await.unwrap();
        assert!(remote.insert("orders", &row).await.is_err());

        let fetched = remote.select("orders", &RowFilter::Id("o1".into())).await.unwrap();
        assert_eq!(fetched, vec![row.clone()]);
        assert!(remote.select("orders", &RowFilter::UpdatedSince(row.updated_at + 1)).await.unwrap().is_empty());

        let mut patch = row.clone();
        patch.data = json!({"total": 2});
        assert_eq!(remote.update("orders", &RowFilter::All, &patch).await.unwrap(), 1);
        assert_eq!(remote.delete("orders", &RowFilter::Id("o1".into())).await.unwrap(), 1);
        assert!(remote.ping().await.is_ok());

        let kinds: Vec<ChangeKind> = (0..3).map(|_| feed.try_recv().unwrap().event_type).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }
}
