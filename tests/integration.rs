//! End-to-end scenarios across every component.
//!
//! Stacks run over in-memory tiers (the authoritative one behind a
//! `FaultyRemote`) or over a tempfile SQLite cache with a file fallback.
//!
//! Run with: `cargo test --test integration`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use storage_resilience::backup::{BackupError, RestoreOptions};
use storage_resilience::harness::HarnessStack;
use storage_resilience::storage::{
    CacheStore, FileFallback, MemoryCache, MemoryFallback, MemoryRemoteStore, SqlCache,
};
use storage_resilience::storage::traits::RemoteRow;
use storage_resilience::{
    BackupStatus, BackupType, ConflictStrategy, ResilienceConfig, ResilienceService, ServiceState,
    StorageCore, StorageConfig, StorageItem, SyncMode, SyncStatus,
};

// =============================================================================
// Helpers
// =============================================================================

fn config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.sync.mode = SyncMode::Manual;
    config.storage.remote_timeout_ms = 250;
    config
}

fn stack() -> HarnessStack {
    HarnessStack::new(&config()).expect("stack")
}

fn stack_with(strategy: ConflictStrategy) -> HarnessStack {
    let mut config = config();
    config.sync.conflict_strategy = strategy;
    HarnessStack::new(&config).expect("stack")
}

async fn inject_later(stack: &HarnessStack, collection: &str, id: &str, data: serde_json::Value) {
    let mut item = StorageItem::new(collection, id, data);
    item.metadata.updated_at += 5_000;
    stack
        .remote
        .inject_remote(collection, &RemoteRow::from_item(&item))
        .await
        .expect("inject");
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn round_trip_returns_written_data() {
    let s = stack();
    let values = [
        json!({"total": 100}),
        json!({"nested": {"list": [1, 2, 3], "flag": true}}),
        json!("plain string"),
        json!(null),
    ];
    for (i, value) in values.iter().enumerate() {
        let id = format!("r{}", i);
        s.core.set("docs", &id, value.clone()).await.unwrap();
        assert_eq!(s.core.get("docs", &id).await.unwrap().as_ref(), Some(value));
    }
}

#[tokio::test]
async fn pending_items_become_synced_after_outage() {
    let s = stack();
    s.remote.set_outage(true);
    for i in 0..10 {
        let report = s.core.set("orders", &format!("o{}", i), json!({"n": i})).await.unwrap();
        assert_eq!(report.item.metadata.sync_status, SyncStatus::Pending);
    }

    s.remote.set_outage(false);
    let report = s.sync.perform_full_sync().await;
    assert!(report.is_clean());

    for item in s.core.list("orders").await.unwrap() {
        assert_eq!(item.metadata.sync_status, SyncStatus::Synced, "{} still pending", item.id);
    }
    assert_eq!(s.remote.inner().len("orders"), 10);
    assert_eq!(s.sync.queue_len().await.unwrap(), 0);
}

#[tokio::test]
async fn one_conflict_record_per_diverged_item() {
    for strategy in [ConflictStrategy::LastWins, ConflictStrategy::Merge, ConflictStrategy::Manual] {
        let s = stack_with(strategy);
        s.remote.set_outage(true);
        for id in ["a", "b", "c"] {
            s.core.set("items", id, json!({"side": "local"})).await.unwrap();
        }
        s.remote.set_outage(false);
        for id in ["a", "b", "c"] {
            inject_later(&s, "items", id, json!({"side": "remote"})).await;
        }

        s.sync.sync_collection("items", true).await;
        // A second pass must not duplicate records
        s.sync.sync_collection("items", true).await;

        let records = s.sync.conflicts(false).await.unwrap();
        assert_eq!(records.len(), 3, "{:?}", strategy);
        let expect_resolved = strategy != ConflictStrategy::Manual;
        assert!(records.iter().all(|r| r.resolved == expect_resolved), "{:?}", strategy);
    }
}

#[tokio::test]
async fn restore_reproduces_backed_up_items() {
    let s = stack();
    for i in 0..5 {
        s.core.set("orders", &format!("o{}", i), json!({"n": i})).await.unwrap();
        s.core.set("users", &format!("u{}", i), json!({"name": format!("user-{}", i)})).await.unwrap();
    }
    let backup = s.backups.create_manual_backup("snapshot", None).await;
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.collections, vec!["orders", "users"]);

    for i in 0..5 {
        s.core.delete("orders", &format!("o{}", i)).await.unwrap();
        s.core.set("users", &format!("u{}", i), json!({"name": "changed"})).await.unwrap();
    }

    let report = s
        .backups
        .restore_backup(&backup.id, RestoreOptions { overwrite: true, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(report.restored(), 10);

    for i in 0..5 {
        assert_eq!(s.core.get("orders", &format!("o{}", i)).await.unwrap(), Some(json!({"n": i})));
        assert_eq!(
            s.core.get("users", &format!("u{}", i)).await.unwrap(),
            Some(json!({"name": format!("user-{}", i)}))
        );
    }
}

#[tokio::test]
async fn automatic_backups_stay_within_retention() {
    let mut config = config();
    config.backup.max_automatic_backups = 3;
    let s = HarnessStack::new(&config).unwrap();
    s.core.set("orders", "o1", json!({})).await.unwrap();
    s.backups.create_emergency_backup("drill").await;

    for _ in 0..6 {
        let meta = s.backups.create_automatic_backup().await;
        assert_eq!(meta.status, BackupStatus::Completed);
        let automatic = s
            .backups
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .filter(|m| m.backup_type == BackupType::Automatic)
            .count();
        assert!(automatic <= 3);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let all = s.backups.list_backups().await.unwrap();
    assert!(all.iter().any(|m| m.backup_type == BackupType::Emergency));
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn scenario_outage_and_recovery() {
    let s = stack();
    s.remote.set_outage(true);

    s.core.set("orders", "o1", json!({"total": 100})).await.unwrap();
    assert_eq!(s.core.get("orders", "o1").await.unwrap(), Some(json!({"total": 100})));

    s.recovery.force_health_check().await;
    let backups = s.backups.list_backups().await.unwrap();
    assert!(backups.iter().any(|m| m.backup_type == BackupType::Emergency));

    s.remote.set_outage(false);
    let report = s.sync.perform_full_sync().await;
    let orders = &report.collections["orders"];
    assert!(orders.synced >= 1);
    assert_eq!(orders.errors, 0);
    assert_eq!(s.remote.inner().row("orders", "o1").unwrap().data, json!({"total": 100}));
}

#[tokio::test]
async fn scenario_conflict_merge() {
    let s = stack_with(ConflictStrategy::Merge);
    s.remote.set_outage(true);
    s.core.set("counters", "x", json!({"counter": 1})).await.unwrap();
    s.remote.set_outage(false);
    inject_later(&s, "counters", "x", json!({"counter": 2, "updated_by": "server"})).await;

    s.sync.perform_full_sync().await;

    let stored = s.core.get("counters", "x").await.unwrap().unwrap();
    assert_eq!(stored, json!({"counter": 1, "updated_by": "server"}));
    let records = s.sync.conflicts(false).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].resolved);
    assert_eq!(s.remote.inner().row("counters", "x").unwrap().data, stored);
}

#[tokio::test]
async fn scenario_corrupted_restore_rejected() {
    let s = stack();
    s.core.set("orders", "o1", json!({"total": 1})).await.unwrap();
    let backup = s.backups.create_manual_backup("b", None).await;

    let mut record = s.cache.get_backup(&backup.id).await.unwrap().unwrap();
    record.metadata.checksum = "f".repeat(64);
    s.cache.put_backup(&record).await.unwrap();

    s.core.set("orders", "o1", json!({"total": 2})).await.unwrap();
    let err = s
        .backups
        .restore_backup(&backup.id, RestoreOptions { overwrite: true, validate_data: true, ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Corrupted { .. }), "{}", err);
    assert_eq!(s.core.get("orders", "o1").await.unwrap(), Some(json!({"total": 2})));
}

#[tokio::test]
async fn failed_backup_is_not_restorable() {
    let mut config = config();
    config.backup.encrypt = true;
    let s = HarnessStack::new(&config).unwrap();
    s.core.set("orders", "o1", json!({})).await.unwrap();

    let meta = s.backups.create_manual_backup("no-key", None).await;
    assert_eq!(meta.status, BackupStatus::Failed);
    assert!(matches!(
        s.backups.restore_backup(&meta.id, RestoreOptions::default()).await,
        Err(BackupError::NotRestorable { .. })
    ));
}

#[tokio::test]
async fn export_import_envelope_between_stacks() {
    let source = stack();
    source.core.set("orders", "o1", json!({"total": 1})).await.unwrap();
    source.core.set("orders", "o2", json!({"total": 2})).await.unwrap();
    let envelope = serde_json::to_value(source.core.export_data(None).await.unwrap()).unwrap();

    let target = stack();
    target.core.set("orders", "o1", json!({"total": 99})).await.unwrap();
    let report = target.core.import_data(&envelope, false).await.unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(target.core.get("orders", "o1").await.unwrap(), Some(json!({"total": 99})));
    assert_eq!(target.core.get("orders", "o2").await.unwrap(), Some(json!({"total": 2})));
}

// =============================================================================
// Durable tiers
// =============================================================================

#[tokio::test]
async fn sqlite_cache_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("cache.db");
    let fallback_dir = dir.path().join("fallback");

    {
        let core = StorageCore::new(
            StorageConfig::default(),
            None,
            Arc::new(SqlCache::open_file(&db).await.unwrap()),
            Arc::new(FileFallback::open(&fallback_dir).await.unwrap()),
        );
        let report = core.set("orders", "o1", json!({"total": 5})).await.unwrap();
        assert_eq!(report.item.metadata.sync_status, SyncStatus::Offline);
    }

    let core = StorageCore::new(
        StorageConfig::default(),
        None,
        Arc::new(SqlCache::open_file(&db).await.unwrap()),
        Arc::new(FileFallback::open(&fallback_dir).await.unwrap()),
    );
    assert_eq!(core.get("orders", "o1").await.unwrap(), Some(json!({"total": 5})));
    let stats = core.storage_stats().await.unwrap();
    assert_eq!(stats.collections["orders"].offline, 1);
}

#[tokio::test]
async fn backup_file_moves_between_sqlite_stacks() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("orders.backup.json");

    let first = ResilienceService::new(
        config(),
        Some(Arc::new(MemoryRemoteStore::new())),
        Arc::new(SqlCache::open_file(dir.path().join("a.db")).await.unwrap()),
        Arc::new(MemoryFallback::new()),
    )
    .unwrap();
    first.core().set("orders", "o1", json!({"total": 3})).await.unwrap();
    let meta = first.backups().create_manual_backup("portable", None).await;
    first.backups().export_backup_to_file(&meta.id, &path).await.unwrap();

    let second = ResilienceService::new(
        config(),
        Some(Arc::new(MemoryRemoteStore::new())),
        Arc::new(SqlCache::open_file(dir.path().join("b.db")).await.unwrap()),
        Arc::new(MemoryFallback::new()),
    )
    .unwrap();
    let imported = second.backups().import_backup_from_file(&path).await.unwrap();
    second.backups().restore_backup(&imported.id, RestoreOptions::default()).await.unwrap();
    assert_eq!(second.core().get("orders", "o1").await.unwrap(), Some(json!({"total": 3})));
}

// =============================================================================
// Service lifecycle
// =============================================================================

#[tokio::test]
async fn service_runs_and_stops_cleanly() {
    let mut config = ResilienceConfig::default();
    config.sync.mode = SyncMode::Adaptive;
    let service = ResilienceService::new(
        config,
        Some(Arc::new(MemoryRemoteStore::new())),
        Arc::new(MemoryCache::new()),
        Arc::new(MemoryFallback::new()),
    )
    .unwrap();

    service.start();
    assert_eq!(service.state(), ServiceState::Running);
    service.core().set("orders", "o1", json!({"total": 1})).await.unwrap();
    let status = service.recovery().force_health_check().await;
    assert!(status.is_healthy(), "{:?}", status.active_failures);

    tokio::time::timeout(Duration::from_secs(5), service.stop()).await.unwrap();
    assert_eq!(service.state(), ServiceState::Stopped);
}
