// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Composition root: wires the four components over caller-supplied tiers
//! and owns their background tasks.
//!
//! # Lifecycle
//!
//! ```text
//! Created ─start()─▶ Starting ─▶ Running ─stop()─▶ ShuttingDown ─▶ Stopped
//! ```
//!
//! `start()` spawns the tier health monitor, the sync drivers for the
//! configured mode, the automatic backup scheduler and the recovery
//! monitor under one [`CancellationToken`]. `stop()` cancels it and joins
//! every task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::{BackupError, BackupManager};
use crate::config::ResilienceConfig;
use crate::core::StorageCore;
use crate::metrics;
use crate::recovery::RecoveryOrchestrator;
use crate::storage::memory::{MemoryCache, MemoryFallback};
use crate::storage::traits::{CacheStore, FallbackStore, RemoteStore};
use crate::storage::{FileFallback, SqlCache, SqlRemoteStore};
use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Constructed, no background tasks
    Created,
    Starting,
    /// Background tasks running
    Running,
    ShuttingDown,
    /// Tasks joined; `start()` may be called again
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct Running {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

pub struct ResilienceService {
    core: Arc<StorageCore>,
    sync: Arc<SyncEngine>,
    backups: Arc<BackupManager>,
    recovery: Arc<RecoveryOrchestrator>,
    state: watch::Sender<ServiceState>,
    running: Mutex<Option<Running>>,
}

impl ResilienceService {
    /// Wire every component. Fails only on an invalid backup encryption key.
    pub fn new(
        config: ResilienceConfig,
        remote: Option<Arc<dyn RemoteStore>>,
        cache: Arc<dyn CacheStore>,
        fallback: Arc<dyn FallbackStore>,
    ) -> Result<Self, BackupError> {
        let core = Arc::new(StorageCore::new(config.storage, remote, cache, fallback));
        let sync = Arc::new(SyncEngine::new(core.clone(), config.sync));
        let backups = Arc::new(BackupManager::new(core.clone(), config.backup)?);
        let recovery = Arc::new(RecoveryOrchestrator::new(
            core.clone(),
            sync.clone(),
            backups.clone(),
            config.recovery,
        ));
        let (state, _) = watch::channel(ServiceState::Created);
        metrics::set_service_state(&ServiceState::Created.to_string());
        Ok(Self {
            core,
            sync,
            backups,
            recovery,
            state,
            running: Mutex::new(None),
        })
    }

    /// Open the tiers named in `config.storage`, then [`Self::new`].
    ///
    /// Without `remote_url` the service runs offline. A missing
    /// `cache_path` or `fallback_dir` puts that tier in memory.
    pub async fn connect(config: ResilienceConfig) -> Result<Self, BackupError> {
        let remote: Option<Arc<dyn RemoteStore>> = match config.storage.remote_url.as_deref() {
            Some(url) => Some(Arc::new(SqlRemoteStore::connect(url).await?)),
            None => None,
        };
        let cache: Arc<dyn CacheStore> = match config.storage.cache_path.as_deref() {
            Some(path) => Arc::new(SqlCache::open_file(path).await?),
            None => Arc::new(MemoryCache::new()),
        };
        let fallback: Arc<dyn FallbackStore> = match config.storage.fallback_dir.as_deref() {
            Some(dir) => Arc::new(FileFallback::open(dir).await?),
            None => Arc::new(MemoryFallback::new()),
        };
        info!(
            remote = remote.is_some(),
            durable_cache = config.storage.cache_path.is_some(),
            durable_fallback = config.storage.fallback_dir.is_some(),
            "Storage tiers opened"
        );
        Self::new(config, remote, cache, fallback)
    }

    #[must_use]
    pub fn core(&self) -> &Arc<StorageCore> {
        &self.core
    }

    #[must_use]
    pub fn sync(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    #[must_use]
    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryOrchestrator> {
        &self.recovery
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_replace(state);
        metrics::set_service_state(&state.to_string());
    }

    /// Spawn every background loop. A no-op when already running.
    ///
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(skip(self))]
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Service already running");
            return;
        }
        self.set_state(ServiceState::Starting);

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        {
            let core = self.core.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { core.run_health_monitor(cancel).await });
        }
        {
            let sync = self.sync.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { sync.run(cancel).await });
        }
        {
            let backups = self.backups.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { backups.run_scheduler(cancel).await });
        }
        {
            let recovery = self.recovery.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { recovery.run(cancel).await });
        }

        info!(tasks = tasks.len(), "Resilience service started");
        *running = Some(Running { cancel, tasks });
        self.set_state(ServiceState::Running);
    }

    /// Cancel every background loop and wait for them to finish.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let Some(Running { cancel, mut tasks }) = self.running.lock().take() else {
            return;
        };
        self.set_state(ServiceState::ShuttingDown);
        cancel.cancel();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        self.set_state(ServiceState::Stopped);
        info!("Resilience service stopped");
    }
}

impl std::fmt::Debug for ResilienceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceService")
            .field("state", &self.state())
            .field("sync", &self.sync)
            .field("backups", &self.backups)
            .finish_non_exhaustive()
    }
}
