//! # Storage Resilience
//!
//! A tiered, offline-tolerant storage layer: every write lands in a local
//! durable cache first and is propagated to an authoritative remote store,
//! with a last-resort fallback store behind both.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        StorageCore                          │
//! │  • set/get/delete/list, cache → authoritative → fallback    │
//! │  • Never fails unless every tier failed                     │
//! │  • Circuit breaker + per-call timeout on the remote tier    │
//! └─────────────────────────────────────────────────────────────┘
//!          │ propagation failures            │ change feed
//!          ▼                                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        SyncEngine                           │
//! │  • Sync queue with retry cap                                │
//! │  • Per-collection reconciliation, conflict strategies       │
//! │  • realtime / batch / manual / adaptive scheduling          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │      BackupManager       │   │     RecoveryOrchestrator     │
//! │  • zstd + ChaCha20 blobs │◀──│  • Health checks → events    │
//! │  • Retention, restore    │   │  • Recovery ladder           │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use storage_resilience::{ResilienceConfig, ResilienceService};
//! use storage_resilience::storage::{MemoryCache, MemoryFallback, MemoryRemoteStore};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = ResilienceService::new(
//!         ResilienceConfig::default(),
//!         Some(Arc::new(MemoryRemoteStore::new())),
//!         Arc::new(MemoryCache::new()),
//!         Arc::new(MemoryFallback::new()),
//!     )
//!     .expect("valid config");
//!     service.start();
//!
//!     service.core().set("orders", "o1", json!({"total": 100})).await.unwrap();
//!     let order = service.core().get("orders", "o1").await.unwrap();
//!     assert_eq!(order, Some(json!({"total": 100})));
//!
//!     let backup = service.backups().create_manual_backup("before-migration", None).await;
//!     println!("backup {} is {}", backup.id, backup.status);
//!
//!     service.stop().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`core`](crate::core): [`StorageCore`], the single read/write entry point
//! - [`sync`]: [`SyncEngine`], queue, conflicts and scheduling
//! - [`backup`]: [`BackupManager`], snapshot codec and restore
//! - [`recovery`]: [`RecoveryOrchestrator`], failure events and the recovery ladder
//! - [`harness`]: fault-injecting tier wrappers and the resilience suite
//! - [`service`]: [`ResilienceService`] lifecycle
//! - [`storage`]: tier traits plus memory, SQL and file backends
//! - [`resilience`]: circuit breaker and retry helpers

pub mod backup;
pub mod compression;
pub mod config;
pub mod core;
pub mod crypto;
pub mod harness;
pub mod metrics;
pub mod recovery;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod storage_item;
pub mod sync;

pub use backup::{BackupManager, BackupMetadata, BackupStatus, BackupType, RestoreOptions, RestoreReport};
pub use config::{BackupConfig, RecoveryConfig, ResilienceConfig, StorageConfig, SyncConfig};
pub use crate::core::{StorageCore, StorageEvent, TierHealth, WriteReport};
pub use harness::{FaultyRemote, ResilienceHarness, SuiteReport, TestResult};
pub use metrics::LatencyTimer;
pub use recovery::{FailureEvent, FailureType, HealthStatus, RecoveryOrchestrator, RecoveryStrategy, Severity};
pub use resilience::circuit_breaker::{CircuitConfig, CircuitError, TierCircuit};
pub use resilience::retry::RetryConfig;
pub use service::{ResilienceService, ServiceState};
pub use storage::traits::{CacheStore, FallbackStore, RemoteStore, StorageError, Tier, TierFailure};
pub use storage_item::{checksum, ItemMetadata, StorageItem, SyncStatus, TierSource};
pub use sync::{ConflictStrategy, FullSyncReport, SyncEngine, SyncMode, SyncResult};
