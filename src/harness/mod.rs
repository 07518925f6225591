// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fault injection and the resilience test suite.
//!
//! [`FaultyRemote`] wraps any [`RemoteStore`] with a toggled outage,
//! injected latency and per-collection failures. [`ResilienceHarness`]
//! runs a fixed suite of scenarios, each on a fresh in-memory stack, and
//! aggregates them into a [`SuiteReport`].
//!
//! ```rust,no_run
//! # async fn demo() {
//! use storage_resilience::harness::ResilienceHarness;
//!
//! let report = ResilienceHarness::default().run_suite().await;
//! println!("{}", report.render());
//! assert!(report.all_passed());
//! # }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::backup::{
    BackupError, BackupManager, BackupMetadata, BackupRecord, BackupStatus, BackupType, RestoreOptions,
};
use crate::config::ResilienceConfig;
use crate::core::StorageCore;
use crate::recovery::{FailureType, RecoveryOrchestrator};
use crate::storage::memory::{MemoryCache, MemoryFallback, MemoryRemoteStore};
use crate::storage::traits::{
    CacheStore, ChangeEvent, ErrorLogEntry, RemoteRow, RemoteStore, RowFilter, StorageError,
};
use crate::storage_item::{StorageItem, SyncStatus};
use crate::sync::{ConflictStrategy, SyncEngine, SyncMode};

// =============================================================================
// Fault-injecting tier wrappers
// =============================================================================

/// Authoritative tier wrapper with switchable faults.
///
/// Faults apply to every data call and to `ping`, except per-collection
/// failures which leave `ping` alone. The change feed is passed through.
pub struct FaultyRemote<S: RemoteStore> {
    inner: S,
    outage: AtomicBool,
    latency_ms: AtomicU64,
    failing: RwLock<HashSet<String>>,
    calls: AtomicU64,
}

impl<S: RemoteStore> FaultyRemote<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            outage: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            failing: RwLock::new(HashSet::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail every call touching `collection`.
    pub fn fail_collection(&self, collection: &str, fail: bool) {
        let mut failing = self.failing.write();
        if fail {
            failing.insert(collection.to_string());
        } else {
            failing.remove(collection);
        }
    }

    /// Calls that reached the wrapper, faulted or not.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Write a server-side value directly, bypassing every fault.
    pub async fn inject_remote(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        self.inner.upsert(collection, row).await
    }

    async fn gate(&self, collection: Option<&str>) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.outage.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected outage".into()));
        }
        if let Some(collection) = collection {
            if self.failing.read().contains(collection) {
                return Err(StorageError::Backend(format!("injected failure for '{}'", collection)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: RemoteStore> RemoteStore for FaultyRemote<S> {
    async fn select(&self, collection: &str, filter: &RowFilter) -> Result<Vec<RemoteRow>, StorageError> {
        self.gate(Some(collection)).await?;
        self.inner.select(collection, filter).await
    }

    async fn insert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        self.gate(Some(collection)).await?;
        self.inner.insert(collection, row).await
    }

    async fn update(&self, collection: &str, filter: &RowFilter, patch: &RemoteRow) -> Result<u64, StorageError> {
        self.gate(Some(collection)).await?;
        self.inner.update(collection, filter, patch).await
    }

    async fn delete(&self, collection: &str, filter: &RowFilter) -> Result<u64, StorageError> {
        self.gate(Some(collection)).await?;
        self.inner.delete(collection, filter).await
    }

    async fn upsert(&self, collection: &str, row: &RemoteRow) -> Result<(), StorageError> {
        self.gate(Some(collection)).await?;
        self.inner.upsert(collection, row).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.inner.subscribe()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.gate(None).await?;
        self.inner.ping().await
    }
}

/// A local cache that rejects every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokenCache;

fn cache_down<T>() -> Result<T, StorageError> {
    Err(StorageError::Backend("cache unavailable".into()))
}

#[async_trait]
impl CacheStore for BrokenCache {
    async fn get_item(&self, _collection: &str, _id: &str) -> Result<Option<StorageItem>, StorageError> {
        cache_down()
    }
    async fn put_item(&self, _item: &StorageItem) -> Result<(), StorageError> {
        cache_down()
    }
    async fn delete_item(&self, _collection: &str, _id: &str) -> Result<(), StorageError> {
        cache_down()
    }
    async fn list_items(&self, _collection: &str) -> Result<Vec<StorageItem>, StorageError> {
        cache_down()
    }
    async fn list_by_status(&self, _collection: &str, _status: SyncStatus) -> Result<Vec<StorageItem>, StorageError> {
        cache_down()
    }
    async fn collections(&self) -> Result<Vec<String>, StorageError> {
        cache_down()
    }
    async fn count_items(&self) -> Result<u64, StorageError> {
        cache_down()
    }
    async fn last_sync(&self, _collection: &str) -> Result<Option<i64>, StorageError> {
        cache_down()
    }
    async fn set_last_sync(&self, _collection: &str, _timestamp: i64) -> Result<(), StorageError> {
        cache_down()
    }
    async fn put_backup(&self, _record: &BackupRecord) -> Result<(), StorageError> {
        cache_down()
    }
    async fn get_backup(&self, _id: &str) -> Result<Option<BackupRecord>, StorageError> {
        cache_down()
    }
    async fn list_backups(&self) -> Result<Vec<BackupMetadata>, StorageError> {
        cache_down()
    }
    async fn delete_backup(&self, _id: &str) -> Result<bool, StorageError> {
        cache_down()
    }
    async fn append_error(&self, _entry: &ErrorLogEntry) -> Result<(), StorageError> {
        cache_down()
    }
    async fn recent_errors(&self, _limit: usize) -> Result<Vec<ErrorLogEntry>, StorageError> {
        cache_down()
    }
    async fn ping(&self) -> Result<(), StorageError> {
        cache_down()
    }
}

// =============================================================================
// Isolated stacks
// =============================================================================

/// Every component wired over in-memory tiers, the authoritative one
/// behind a [`FaultyRemote`].
pub struct HarnessStack {
    pub remote: Arc<FaultyRemote<MemoryRemoteStore>>,
    pub cache: Arc<MemoryCache>,
    pub core: Arc<StorageCore>,
    pub sync: Arc<SyncEngine>,
    pub backups: Arc<BackupManager>,
    pub recovery: Arc<RecoveryOrchestrator>,
}

impl HarnessStack {
    pub fn new(config: &ResilienceConfig) -> Result<Self, BackupError> {
        let remote = Arc::new(FaultyRemote::new(MemoryRemoteStore::new()));
        let cache = Arc::new(MemoryCache::new());
        let core = Arc::new(StorageCore::new(
            config.storage.clone(),
            Some(remote.clone()),
            cache.clone(),
            Arc::new(MemoryFallback::new()),
        ));
        let sync = Arc::new(SyncEngine::new(core.clone(), config.sync.clone()));
        let backups = Arc::new(BackupManager::new(core.clone(), config.backup.clone())?);
        let recovery = Arc::new(RecoveryOrchestrator::new(
            core.clone(),
            sync.clone(),
            backups.clone(),
            config.recovery.clone(),
        ));
        Ok(Self { remote, cache, core, sync, backups, recovery })
    }
}

// =============================================================================
// Suite
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    pub test_name: String,
    pub success: bool,
    pub duration: Duration,
    pub details: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SuiteReport {
    pub results: Vec<TestResult>,
}

impl SuiteReport {
    #[must_use]
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    #[must_use]
    pub fn average_duration(&self) -> Duration {
        if self.results.is_empty() {
            return Duration::ZERO;
        }
        self.results.iter().map(|r| r.duration).sum::<Duration>() / self.results.len() as u32
    }

    /// Human-readable summary, one line per test plus recommendations.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("Resilience test suite\n=====================\n");
        for r in &self.results {
            out.push_str(&format!(
                "[{}] {} ({} ms): {}\n",
                if r.success { "PASS" } else { "FAIL" },
                r.test_name,
                r.duration.as_millis(),
                r.details
            ));
            for rec in &r.recommendations {
                out.push_str(&format!("    - {}\n", rec));
            }
        }
        out.push_str(&format!(
            "\n{} passed, {} failed, average {} ms\n",
            self.passed(),
            self.failed(),
            self.average_duration().as_millis()
        ));
        out
    }
}

type Outcome = Result<String, String>;

fn ensure(condition: bool, message: impl Into<String>) -> Result<(), String> {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

fn fail<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> String {
    move |e| format!("{}: {}", context, e)
}

/// Fixed suite of fault-injection scenarios.
#[derive(Debug, Clone)]
pub struct ResilienceHarness {
    config: ResilienceConfig,
    load_items: usize,
}

impl Default for ResilienceHarness {
    fn default() -> Self {
        let mut config = ResilienceConfig::default();
        config.sync.mode = SyncMode::Manual;
        config.storage.remote_timeout_ms = 250;
        Self::new(config)
    }
}

impl ResilienceHarness {
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config, load_items: 50 }
    }

    #[must_use]
    pub fn with_load_items(mut self, n: usize) -> Self {
        self.load_items = n;
        self
    }

    fn stack(&self, config: &ResilienceConfig) -> Result<HarnessStack, String> {
        HarnessStack::new(config).map_err(fail("stack setup"))
    }

    async fn run_test<F>(name: &str, recommendations: &[&str], test: F) -> TestResult
    where
        F: Future<Output = Outcome>,
    {
        let started = Instant::now();
        let outcome = test.await;
        let duration = started.elapsed();
        let (success, details, recommendations) = match outcome {
            Ok(details) => (true, details, Vec::new()),
            Err(details) => (false, details, recommendations.iter().map(|r| r.to_string()).collect()),
        };
        if success {
            info!(test = name, duration_ms = duration.as_millis() as u64, "Resilience test passed");
        } else {
            warn!(test = name, details = %details, "Resilience test failed");
        }
        TestResult { test_name: name.to_string(), success, duration, details, recommendations }
    }

    /// Authoritative tier down: writes land locally, an emergency backup is
    /// taken, and a full sync succeeds once it returns.
    pub async fn test_outage(&self) -> TestResult {
        Self::run_test(
            "outage",
            &[
                "Check that the local cache accepts writes while the authoritative tier is down",
                "Enable emergency_backup_on_failure",
            ],
            self.outage_scenario(),
        )
        .await
    }

    async fn outage_scenario(&self) -> Outcome {
        let s = self.stack(&self.config)?;
        s.remote.set_outage(true);

        let report = s.core.set("orders", "o1", json!({"total": 100})).await.map_err(fail("write during outage"))?;
        ensure(!report.propagated(), "write reached a tier that should be down")?;
        let value = s.core.get("orders", "o1").await.map_err(fail("read during outage"))?;
        ensure(value == Some(json!({"total": 100})), format!("read back {:?}", value))?;

        s.recovery.force_health_check().await;
        let backups = s.backups.list_backups().await.map_err(fail("list backups"))?;
        ensure(
            backups.iter().any(|m| m.backup_type == BackupType::Emergency && m.status == BackupStatus::Completed),
            "no completed emergency backup after outage detection",
        )?;

        s.remote.set_outage(false);
        let sync = s.sync.perform_full_sync().await;
        let orders = sync.collections.get("orders").cloned().unwrap_or_default();
        ensure(orders.synced >= 1, format!("orders synced {} items", orders.synced))?;
        ensure(orders.errors == 0 && sync.is_clean(), format!("full sync reported {} errors", sync.errors()))?;
        Ok(format!("write served locally, emergency backup taken, {} items synced after recovery", sync.synced()))
    }

    /// Integrity scan flags a damaged item without panicking and a manual
    /// backup still completes.
    pub async fn test_corruption(&self) -> TestResult {
        Self::run_test(
            "corruption",
            &["Keep a recent completed backup so corrupted items can be restored"],
            self.corruption_scenario(),
        )
        .await
    }

    async fn corruption_scenario(&self) -> Outcome {
        let s = self.stack(&self.config)?;
        s.core.set("orders", "good", json!({"total": 1})).await.map_err(fail("write"))?;
        s.core.set("orders", "bad", json!({"total": 2})).await.map_err(fail("write"))?;

        let mut damaged = s
            .cache
            .get_item("orders", "bad")
            .await
            .map_err(fail("cache read"))?
            .ok_or("written item missing from cache")?;
        damaged.data = json!({"total": "garbage"});
        s.cache.put_item(&damaged).await.map_err(fail("cache write"))?;

        let checks = s.recovery.run_checks().await;
        ensure(
            checks.findings.iter().any(|f| f.failure_type == FailureType::DataCorruption),
            "integrity scan missed a checksum mismatch",
        )?;

        let backup = s.backups.create_manual_backup("post-corruption", None).await;
        ensure(
            backup.status == BackupStatus::Completed,
            format!("manual backup {}: {:?}", backup.status, backup.error),
        )?;
        Ok(format!("corruption detected, manual backup {} completed", backup.id))
    }

    /// Slow authoritative tier: reads are served locally within the
    /// timeout and converge once latency is removed.
    pub async fn test_latency(&self) -> TestResult {
        Self::run_test(
            "latency",
            &["Lower remote_timeout_ms so slow calls fall back to the cache sooner"],
            self.latency_scenario(),
        )
        .await
    }

    async fn latency_scenario(&self) -> Outcome {
        let s = self.stack(&self.config)?;
        let timeout = Duration::from_millis(self.config.storage.remote_timeout_ms);
        s.remote.set_latency(timeout * 2);

        let started = Instant::now();
        s.core.set("orders", "slow", json!({"total": 7})).await.map_err(fail("write under latency"))?;
        let value = s.core.get("orders", "slow").await.map_err(fail("read under latency"))?;
        let elapsed = started.elapsed();
        ensure(value == Some(json!({"total": 7})), format!("read back {:?}", value))?;
        let patience = timeout * 4 + Duration::from_secs(1);
        ensure(elapsed < patience, format!("took {} ms", elapsed.as_millis()))?;

        s.remote.set_latency(Duration::ZERO);
        let sync = s.sync.perform_full_sync().await;
        ensure(sync.is_clean(), format!("catch-up sync reported {} errors", sync.errors()))?;
        let row = s.remote.inner().row("orders", "slow").ok_or("value never reached the authoritative tier")?;
        ensure(row.data == json!({"total": 7}), format!("authoritative holds {}", row.data))?;
        Ok(format!("served locally in {} ms, converged after latency removed", elapsed.as_millis()))
    }

    /// Divergent local and remote values produce one conflict record,
    /// resolved by `merge`.
    pub async fn test_conflicts(&self) -> TestResult {
        Self::run_test(
            "conflicts",
            &["Review conflict_strategy; manual conflicts need resolve_conflict"],
            self.conflict_scenario(),
        )
        .await
    }

    async fn conflict_scenario(&self) -> Outcome {
        let mut config = self.config.clone();
        config.sync.conflict_strategy = ConflictStrategy::Merge;
        let s = self.stack(&config)?;

        s.remote.set_outage(true);
        s.core.set("counters", "x", json!({"counter": 1})).await.map_err(fail("local write"))?;
        s.remote.set_outage(false);

        let mut remote = StorageItem::new("counters", "x", json!({"counter": 2, "source": "remote"}));
        remote.metadata.updated_at += 5_000;
        s.remote
            .inject_remote("counters", &RemoteRow::from_item(&remote))
            .await
            .map_err(fail("inject remote value"))?;

        let result = s.sync.sync_collection("counters", true).await;
        ensure(result.conflicts == 1, format!("{} conflicts detected", result.conflicts))?;
        let records = s.sync.conflicts(false).await.map_err(fail("list conflicts"))?;
        ensure(records.len() == 1, format!("{} conflict records", records.len()))?;
        ensure(records[0].resolved, "merge conflict left unresolved")?;

        let merged = s.core.get("counters", "x").await.map_err(fail("read merged"))?;
        let expected: Value = json!({"counter": 1, "source": "remote"});
        ensure(merged.as_ref() == Some(&expected), format!("merged value {:?}", merged))?;
        Ok("conflict recorded and merged".to_string())
    }

    /// Outage, then cache damage repaired from the emergency backup taken
    /// during the outage.
    pub async fn test_auto_recovery(&self) -> TestResult {
        Self::run_test(
            "auto-recovery",
            &[
                "Enable auto_recovery and keep check_interval_secs short",
                "Keep emergency_backup_on_failure on so a restore point exists",
            ],
            self.auto_recovery_scenario(),
        )
        .await
    }

    async fn auto_recovery_scenario(&self) -> Outcome {
        let s = self.stack(&self.config)?;
        let written = [("o1", json!({"total": 1})), ("o2", json!({"total": 2}))];
        s.core.set("orders", written[0].0, written[0].1.clone()).await.map_err(fail("write"))?;
        s.remote.set_outage(true);
        s.core
            .set("orders", written[1].0, written[1].1.clone())
            .await
            .map_err(fail("write during outage"))?;

        let degraded = s.recovery.force_health_check().await;
        ensure(!degraded.is_healthy(), "outage not detected")?;

        let emergency = s
            .backups
            .list_backups()
            .await
            .map_err(fail("list backups"))?
            .into_iter()
            .find(|m| m.backup_type == BackupType::Emergency && m.status == BackupStatus::Completed)
            .ok_or("no emergency backup was taken")?;
        let dry_run = s
            .backups
            .restore_backup(&emergency.id, RestoreOptions { dry_run: true, ..Default::default() })
            .await
            .map_err(fail("emergency backup does not validate"))?;
        ensure(dry_run.total() >= 2, format!("emergency backup holds {} items", dry_run.total()))?;

        s.remote.set_outage(false);
        let healthy = s.recovery.force_health_check().await;
        ensure(
            healthy.is_healthy(),
            format!("still {} with {} active failures", healthy.overall, healthy.active_failures.len()),
        )?;

        // Damage every cached copy after the restore point
        tokio::time::sleep(Duration::from_millis(5)).await;
        for (id, _) in &written {
            let mut damaged = s
                .cache
                .get_item("orders", id)
                .await
                .map_err(fail("cache read"))?
                .ok_or("written item missing from cache")?;
            damaged.data = json!({"total": "garbage"});
            s.cache.put_item(&damaged).await.map_err(fail("cache write"))?;
        }

        s.recovery.force_health_check().await;
        let mut event = s
            .recovery
            .failure_history()
            .into_iter()
            .find(|e| e.failure_type == FailureType::DataCorruption)
            .ok_or("cache damage not detected")?;
        if !event.resolved {
            event = s
                .recovery
                .trigger_manual_recovery(&event.id)
                .await
                .map_err(fail("recovery"))?;
        }
        ensure(
            event.resolved,
            format!("corruption left {:?} ({:?})", event.state, event.last_error),
        )?;

        for (id, expected) in &written {
            let restored = s
                .cache
                .get_item("orders", id)
                .await
                .map_err(fail("cache read"))?
                .ok_or("restored item missing from cache")?;
            ensure(
                &restored.data == expected && restored.checksum_matches(),
                format!("{} restored as {}", id, restored.data),
            )?;
            let read = s.core.get("orders", id).await.map_err(fail("read after restore"))?;
            ensure(read.as_ref() == Some(expected), format!("{} reads back as {:?}", id, read))?;
        }
        Ok(format!("cache restored from emergency backup {}", emergency.id))
    }

    /// Concurrent writes and reads, then a clean full sync.
    pub async fn test_load(&self) -> TestResult {
        Self::run_test(
            "load",
            &["Check cache write throughput and the sync queue drain interval"],
            self.load_scenario(),
        )
        .await
    }

    async fn load_scenario(&self) -> Outcome {
        let s = self.stack(&self.config)?;
        let mut tasks = JoinSet::new();
        for i in 0..self.load_items {
            let core = s.core.clone();
            tasks.spawn(async move {
                let id = format!("item-{}", i);
                core.set("load", &id, json!({"n": i})).await?;
                core.get("load", &id).await
            });
        }

        let mut missing = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(_))) => {}
                Ok(Ok(None)) => missing += 1,
                Ok(Err(e)) => return Err(format!("operation failed: {}", e)),
                Err(e) => return Err(format!("task panicked: {}", e)),
            }
        }
        ensure(missing == 0, format!("{} of {} reads returned nothing", missing, self.load_items))?;

        let sync = s.sync.perform_full_sync().await;
        ensure(sync.is_clean(), format!("full sync reported {} errors", sync.errors()))?;
        ensure(
            s.remote.inner().len("load") == self.load_items,
            format!("{} of {} items reached the authoritative tier", s.remote.inner().len("load"), self.load_items),
        )?;
        Ok(format!("{} concurrent writes and reads, full sync clean", self.load_items))
    }

    /// Run every test, each on its own stack.
    pub async fn run_suite(&self) -> SuiteReport {
        let results = vec![
            self.test_outage().await,
            self.test_corruption().await,
            self.test_latency().await,
            self.test_conflicts().await,
            self.test_auto_recovery().await,
            self.test_load().await,
        ];
        let report = SuiteReport { results };
        info!(passed = report.passed(), failed = report.failed(), "Resilience suite finished");
        report
    }
}
