// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery orchestrator: turns failed health checks into durable
//! [`FailureEvent`]s and walks the recovery ladder.
//!
//! # Event lifecycle
//!
//! ```text
//! check fails ─▶ detected ─▶ recovering ─▶ resolved
//!                                      └─▶ needs-manual-intervention
//! check passes ─▶ open events of that type resolved ("condition cleared")
//! ```
//!
//! A failing check while an event of the same type is still open does not
//! open a second event. Events of severity `high` or above trigger an
//! emergency backup. Every event is mirrored into the cache error log.
//!
//! # Ladder
//!
//! Configured strategies are tried in order, skipping those that do not
//! apply to the failure type, until one succeeds or the attempt cap is
//! reached. `manual-intervention` is terminal and never marks the event
//! resolved.

pub mod checks;
pub mod types;

pub use types::{
    CheckReport, FailureEvent, FailureState, FailureType, Finding, HealthStatus, OverallHealth, RecoveryError,
    RecoveryStrategy, Severity,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupManager, RestoreOptions};
use crate::config::RecoveryConfig;
use crate::core::StorageCore;
use crate::metrics;
use crate::storage_item::now_millis;
use crate::sync::SyncEngine;

pub struct RecoveryOrchestrator {
    core: Arc<StorageCore>,
    sync: Arc<SyncEngine>,
    backups: Arc<BackupManager>,
    config: RecoveryConfig,
    /// Bounded history, oldest first
    events: RwLock<VecDeque<FailureEvent>>,
    last_check: RwLock<Option<i64>>,
    /// One ladder walk at a time
    recovery_lock: Mutex<()>,
}

impl RecoveryOrchestrator {
    pub fn new(
        core: Arc<StorageCore>,
        sync: Arc<SyncEngine>,
        backups: Arc<BackupManager>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            core,
            sync,
            backups,
            config,
            events: RwLock::new(VecDeque::new()),
            last_check: RwLock::new(None),
            recovery_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Every retained event, newest first.
    #[must_use]
    pub fn failure_history(&self) -> Vec<FailureEvent> {
        self.events.read().iter().rev().cloned().collect()
    }

    #[must_use]
    pub fn active_failures(&self) -> Vec<FailureEvent> {
        self.events.read().iter().rev().filter(|e| e.is_open()).cloned().collect()
    }

    #[must_use]
    pub fn failure(&self, id: &str) -> Option<FailureEvent> {
        self.events.read().iter().find(|e| e.id == id).cloned()
    }

    fn store_event(&self, event: &FailureEvent) {
        let mut events = self.events.write();
        if let Some(existing) = events.iter_mut().find(|e| e.id == event.id) {
            *existing = event.clone();
            return;
        }
        events.push_back(event.clone());
        while events.len() > self.config.history_cap.max(1) {
            // Prefer dropping the oldest resolved event
            match events.iter().position(|e| e.resolved) {
                Some(pos) => {
                    events.remove(pos);
                }
                None => {
                    events.pop_front();
                }
            }
        }
    }

    async fn mirror(&self, event: &FailureEvent) {
        self.core
            .log_error(
                &event.failure_type.to_string(),
                &event.description,
                json!({
                    "failure_id": event.id,
                    "severity": event.severity,
                    "state": event.state,
                    "recovery_attempts": event.recovery_attempts,
                    "last_error": event.last_error,
                    "affected_collections": event.affected_collections,
                }),
            )
            .await;
    }

    /// Resolve open events for checks that passed, open events for new
    /// findings. Returns ids of newly opened events.
    async fn apply_report(&self, report: CheckReport) -> Vec<String> {
        let cleared: Vec<FailureEvent> = {
            let mut events = self.events.write();
            events
                .iter_mut()
                .filter(|e| e.is_open() && report.passed.contains(&e.failure_type))
                .map(|e| {
                    e.resolve();
                    e.clone()
                })
                .collect()
        };
        for event in &cleared {
            info!(failure_id = %event.id, failure_type = %event.failure_type, "Failure condition cleared");
            self.mirror(event).await;
        }

        let mut opened = Vec::new();
        for finding in report.findings {
            let already_open = self
                .events
                .read()
                .iter()
                .any(|e| e.is_open() && e.failure_type == finding.failure_type);
            if already_open {
                debug!(failure_type = %finding.failure_type, "Failure already tracked");
                continue;
            }

            let event = FailureEvent::new(
                finding.failure_type,
                finding.severity,
                finding.description,
                finding.affected_collections,
            );
            warn!(
                failure_id = %event.id,
                failure_type = %event.failure_type,
                severity = %event.severity,
                description = %event.description,
                "Failure detected"
            );
            metrics::record_failure_event(&event.failure_type.to_string(), &event.severity.to_string());
            self.store_event(&event);
            self.mirror(&event).await;

            if event.severity >= Severity::High && self.config.emergency_backup_on_failure {
                let backup = self
                    .backups
                    .create_emergency_backup(&format!("{}: {}", event.failure_type, event.description))
                    .await;
                info!(failure_id = %event.id, backup_id = %backup.id, status = %backup.status, "Emergency backup taken");
            }
            opened.push(event.id);
        }
        opened
    }

    async fn execute(&self, strategy: RecoveryStrategy, event: &FailureEvent) -> Result<(), String> {
        match strategy {
            RecoveryStrategy::CacheFallback | RecoveryStrategy::SyncRetry => {
                if self.core.has_remote() {
                    self.core
                        .probe_remote()
                        .await
                        .map_err(|e| format!("authoritative tier unreachable: {}", e))?;
                }
                let report = self.sync.perform_full_sync().await;
                if report.is_clean() {
                    Ok(())
                } else {
                    Err(format!("full sync finished with {} errors", report.errors()))
                }
            }
            RecoveryStrategy::BackupRestore => {
                // Backups taken after detection hold the damaged state
                let candidate = self
                    .backups
                    .list_backups()
                    .await
                    .map_err(|e| e.to_string())?
                    .into_iter()
                    .find(|m| {
                        m.status == crate::backup::BackupStatus::Completed
                            && m.created_at < event.detected_at
                            && m.covers(&event.affected_collections)
                    })
                    .ok_or_else(|| "no completed backup covers the affected collections".to_string())?;
                let options = RestoreOptions {
                    collections: if event.affected_collections.is_empty() {
                        None
                    } else {
                        Some(event.affected_collections.clone())
                    },
                    overwrite: true,
                    ..Default::default()
                };
                let report = self
                    .backups
                    .restore_backup(&candidate.id, options)
                    .await
                    .map_err(|e| e.to_string())?;
                if report.failed() > 0 {
                    return Err(format!("{} items failed to restore from '{}'", report.failed(), candidate.id));
                }
                info!(failure_id = %event.id, backup_id = %candidate.id, restored = report.restored(), "Restored from backup");
                Ok(())
            }
            RecoveryStrategy::ManualIntervention => Ok(()),
        }
    }

    /// Walk the ladder for one event.
    async fn recover(&self, id: &str) -> Result<FailureEvent, RecoveryError> {
        let _walk = self.recovery_lock.lock().await;
        let mut event = self.failure(id).ok_or_else(|| RecoveryError::NotFound(id.to_string()))?;
        if event.resolved {
            return Err(RecoveryError::AlreadyResolved(id.to_string()));
        }
        event.state = FailureState::Recovering;
        self.store_event(&event);

        let mut attempts = 0u32;
        for strategy in self.config.strategies.iter().copied().filter(|s| s.applies_to(event.failure_type)) {
            if attempts >= self.config.max_recovery_attempts {
                debug!(failure_id = %event.id, attempts, "Recovery attempt cap reached");
                break;
            }
            attempts += 1;
            event.recovery_attempts += 1;

            if strategy == RecoveryStrategy::ManualIntervention {
                metrics::record_recovery_attempt(&strategy.to_string(), true);
                event.state = FailureState::NeedsManualIntervention;
                event.last_error.get_or_insert_with(|| "operator action required".to_string());
                warn!(failure_id = %event.id, failure_type = %event.failure_type, "Recovery needs manual intervention");
                break;
            }

            match self.execute(strategy, &event).await {
                Ok(()) => {
                    metrics::record_recovery_attempt(&strategy.to_string(), true);
                    info!(failure_id = %event.id, strategy = %strategy, attempts = event.recovery_attempts, "Recovery succeeded");
                    event.resolve();
                    break;
                }
                Err(e) => {
                    metrics::record_recovery_attempt(&strategy.to_string(), false);
                    warn!(failure_id = %event.id, strategy = %strategy, error = %e, "Recovery strategy failed");
                    event.last_error = Some(format!("{}: {}", strategy, e));
                }
            }
        }

        if !event.resolved && event.state == FailureState::Recovering {
            error!(failure_id = %event.id, last_error = ?event.last_error, "Recovery strategies exhausted");
            event.state = FailureState::NeedsManualIntervention;
        }
        self.store_event(&event);
        self.mirror(&event).await;
        Ok(event)
    }

    /// Run the ladder for an event on operator request, regardless of
    /// `auto_recovery`.
    #[tracing::instrument(skip(self))]
    pub async fn trigger_manual_recovery(&self, failure_id: &str) -> Result<FailureEvent, RecoveryError> {
        self.recover(failure_id).await
    }

    #[must_use]
    fn overall(active: &[FailureEvent]) -> OverallHealth {
        if active.iter().any(|e| e.severity == Severity::Critical) {
            OverallHealth::Critical
        } else if active.is_empty() {
            OverallHealth::Healthy
        } else {
            OverallHealth::Degraded
        }
    }

    /// Summary from the latest probes and open events. Runs no checks.
    pub async fn get_health_status(&self) -> HealthStatus {
        let active = self.active_failures();
        HealthStatus {
            overall: Self::overall(&active),
            tiers: self.core.last_health(),
            active_failures: active,
            queue_len: self.sync.queue_len().await.unwrap_or(0),
            unresolved_conflicts: self.sync.unresolved_conflict_count().await.unwrap_or(0),
            last_check: *self.last_check.read(),
        }
    }

    /// Probe tiers, run every check, and recover new events when enabled.
    #[tracing::instrument(skip(self))]
    pub async fn force_health_check(&self) -> HealthStatus {
        self.core.health_check().await;
        let report = self.run_checks().await;
        *self.last_check.write() = Some(now_millis());

        let opened = self.apply_report(report).await;
        if self.config.auto_recovery {
            for id in opened {
                let Some(event) = self.failure(&id) else { continue };
                if event.severity <= Severity::Low {
                    continue;
                }
                if let Err(e) = self.recover(&id).await {
                    debug!(failure_id = %id, error = %e, "Recovery skipped");
                }
            }
        }

        let status = self.get_health_status().await;
        metrics::set_overall_health(&status.overall.to_string());
        status
    }

    /// Check on a fixed interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.check_interval_secs, "Recovery monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.force_health_check().await;
                }
            }
        }
        info!("Recovery monitor stopped");
    }
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("auto_recovery", &self.config.auto_recovery)
            .field("events", &self.events.read().len())
            .finish_non_exhaustive()
    }
}
