// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage core: write-through / read-through access to the three tiers.
//!
//! ```text
//!   set ─▶ cache (write-ahead) ─▶ authoritative ──ok──▶ mark synced
//!                                      │
//!                                    error ─▶ fallback copy + PropagationFailed
//!
//!   get ─▶ authoritative ─▶ cache ─▶ fallback   (first hit wins, remote hit fills the cache)
//! ```
//!
//! Tier errors are absorbed and reported in [`WriteReport`] / [`ReadOutcome`];
//! only a failure of every tier surfaces as [`StorageError::AllTiersFailed`].
//! Every authoritative call is bounded by a timeout and a circuit breaker.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use storage_resilience::{StorageCore, StorageConfig};
//! use storage_resilience::storage::{MemoryCache, MemoryFallback, MemoryRemoteStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let core = StorageCore::new(
//!     StorageConfig::default(),
//!     Some(Arc::new(MemoryRemoteStore::new())),
//!     Arc::new(MemoryCache::new()),
//!     Arc::new(MemoryFallback::new()),
//! );
//!
//! let report = core.set("orders", "o1", json!({"total": 100})).await.unwrap();
//! assert!(report.propagated());
//! assert_eq!(core.get("orders", "o1").await.unwrap(), Some(json!({"total": 100})));
//! # }
//! ```

mod api;
mod health;
mod records;
pub mod types;

pub use types::{
    CollectionStats, DeleteReport, ExportEnvelope, ImportReport, ReadOutcome, StorageEvent,
    StorageStats, TierHealth, WriteAction, WriteReport, EXPORT_VERSION,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};

use crate::config::StorageConfig;
use crate::metrics;
use crate::resilience::circuit_breaker::{CircuitError, TierCircuit};
use crate::storage::traits::{CacheStore, ChangeEvent, FallbackStore, RemoteStore, StorageError, Tier};
use crate::storage_item::item_key;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct StorageCore {
    pub(super) config: StorageConfig,
    pub(super) remote: Option<Arc<dyn RemoteStore>>,
    pub(super) cache: Arc<dyn CacheStore>,
    pub(super) fallback: Arc<dyn FallbackStore>,
    pub(super) circuit: TierCircuit,
    pub(super) health_tx: watch::Sender<TierHealth>,
    pub(super) events: broadcast::Sender<StorageEvent>,
    /// Single writer for the local cache
    pub(super) write_lock: Mutex<()>,
    /// Per-item guards held across a local write and its authoritative
    /// counterpart, so two pipelines for one item never interleave
    item_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusive hold on one item's write pipeline. The map entry is dropped
/// with the last holder.
pub(crate) struct ItemGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are only taken under the shard lock, so a count of one
        // means nobody is waiting
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl StorageCore {
    /// Compose a core over the given tiers. `remote = None` runs offline:
    /// items are kept locally with status `offline`.
    pub fn new(
        config: StorageConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        cache: Arc<dyn CacheStore>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Self {
        let circuit = TierCircuit::new("authoritative", config.circuit_config());
        let (health_tx, _) = watch::channel(TierHealth::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            remote,
            cache,
            fallback,
            circuit,
            health_tx,
            events,
            write_lock: Mutex::new(()),
            item_locks: DashMap::new(),
        }
    }

    /// Serialize writers of one item. Lock order is item guard first, then
    /// the cache write lock; the guard is not reentrant.
    pub(crate) async fn lock_item(&self, collection: &str, id: &str) -> ItemGuard<'_> {
        let key = item_key(collection, id);
        let lock = self.item_locks.entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        ItemGuard { locks: &self.item_locks, key, guard: Some(guard) }
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    #[must_use]
    pub fn circuit(&self) -> &TierCircuit {
        &self.circuit
    }

    /// Subscribe to write and health notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    /// Authoritative change feed, when the tier has one.
    #[must_use]
    pub fn subscribe_changes(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.remote.as_ref().and_then(|r| r.subscribe())
    }

    /// Latest probe result, updated by [`Self::health_check`].
    #[must_use]
    pub fn health_receiver(&self) -> watch::Receiver<TierHealth> {
        self.health_tx.subscribe()
    }

    #[must_use]
    pub fn last_health(&self) -> TierHealth {
        self.health_tx.borrow().clone()
    }

    fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.config.remote_timeout_ms)
    }

    /// Run `f` against the authoritative tier through the circuit breaker
    /// and the per-call deadline.
    pub(crate) async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<dyn RemoteStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let remote = self
            .remote
            .clone()
            .ok_or(StorageError::NotConfigured { tier: Tier::Authoritative })?;
        let timeout = self.remote_timeout();
        let timeout_ms = self.config.remote_timeout_ms;
        let _timer = metrics::LatencyTimer::new("authoritative", operation);

        let result = self
            .circuit
            .call(|| async move {
                match tokio::time::timeout(timeout, f(remote)).await {
                    Ok(result) => result,
                    Err(_) => Err(StorageError::Timeout { tier: Tier::Authoritative, timeout_ms }),
                }
            })
            .await;

        match result {
            Ok(value) => {
                metrics::record_operation("authoritative", operation, "success");
                Ok(value)
            }
            Err(CircuitError::Rejected) => {
                metrics::record_operation("authoritative", operation, "rejected");
                Err(StorageError::CircuitOpen { tier: Tier::Authoritative })
            }
            Err(CircuitError::Inner(e)) => {
                if matches!(e, StorageError::Timeout { .. }) {
                    metrics::record_timeout("authoritative", operation);
                }
                metrics::record_operation("authoritative", operation, "error");
                Err(e)
            }
        }
    }

    fn emit(&self, event: StorageEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for StorageCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageCore")
            .field("remote_configured", &self.has_remote())
            .field("circuit", &self.circuit)
            .finish_non_exhaustive()
    }
}
