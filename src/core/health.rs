// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier health probes.
//!
//! A single failed probe flags the tier unhealthy; the next interval gets a
//! fresh chance. A successful authoritative probe also closes the circuit
//! breaker so traffic resumes without waiting out the open timeout.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{StorageEvent, TierHealth};
use super::StorageCore;
use crate::metrics;
use crate::storage::traits::{StorageError, Tier};
use crate::storage_item::now_millis;

impl StorageCore {
    /// Probe the authoritative tier directly, bypassing the circuit breaker.
    pub async fn probe_remote(&self) -> Result<Duration, StorageError> {
        let remote = self
            .remote
            .clone()
            .ok_or(StorageError::NotConfigured { tier: Tier::Authoritative })?;
        let timeout_ms = self.config.remote_timeout_ms;
        let started = Instant::now();
        match tokio::time::timeout(self.remote_timeout(), remote.ping()).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                metrics::record_latency("authoritative", "ping", elapsed);
                Ok(elapsed)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                metrics::record_timeout("authoritative", "ping");
                Err(StorageError::Timeout { tier: Tier::Authoritative, timeout_ms })
            }
        }
    }

    pub(crate) async fn probe_local(&self, tier: Tier) -> Result<(), StorageError> {
        let timeout_ms = self.config.remote_timeout_ms;
        let probe = async {
            match tier {
                Tier::Cache => self.cache.ping().await,
                _ => self.fallback.ping().await,
            }
        };
        match tokio::time::timeout(self.remote_timeout(), probe).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout { tier, timeout_ms }),
        }
    }

    /// Probe the authoritative tier and close the circuit if it answers.
    pub async fn refresh_circuit(&self) -> bool {
        match self.probe_remote().await {
            Ok(_) => {
                self.circuit.reset();
                true
            }
            Err(e) => {
                debug!(error = %e, "Authoritative tier still unreachable");
                false
            }
        }
    }

    /// Probe every tier once and publish the result.
    #[tracing::instrument(skip(self))]
    pub async fn health_check(&self) -> TierHealth {
        let mut health = TierHealth { checked_at: Some(now_millis()), ..Default::default() };

        match self.probe_remote().await {
            Ok(latency) => {
                health.authoritative = true;
                health.authoritative_latency_ms = Some(latency.as_millis() as u64);
                if self.circuit.is_open() {
                    info!("Authoritative tier reachable again, closing circuit");
                }
                self.circuit.reset();
            }
            Err(StorageError::NotConfigured { .. }) => {}
            Err(e) => warn!(tier = "authoritative", error = %e, "Health probe failed"),
        }

        match self.probe_local(Tier::Cache).await {
            Ok(()) => health.cache = true,
            Err(e) => warn!(tier = "cache", error = %e, "Health probe failed"),
        }
        match self.probe_local(Tier::Fallback).await {
            Ok(()) => health.fallback = true,
            Err(e) => warn!(tier = "fallback", error = %e, "Health probe failed"),
        }

        metrics::set_tier_healthy("authoritative", health.authoritative);
        metrics::set_tier_healthy("cache", health.cache);
        metrics::set_tier_healthy("fallback", health.fallback);

        let previous = self.health_tx.send_replace(health.clone());
        if previous.checked_at.is_none() || previous.differs_from(&health) {
            info!(
                authoritative = health.authoritative,
                cache = health.cache,
                fallback = health.fallback,
                "Tier health changed"
            );
            self.emit(StorageEvent::HealthChanged(health.clone()));
        } else {
            debug!(latency_ms = ?health.authoritative_latency_ms, "Tier health unchanged");
        }
        health
    }

    /// Probe on a fixed interval until cancelled.
    pub async fn run_health_monitor(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.health_check_interval_secs, "Health monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.health_check().await;
                }
            }
        }
        info!("Health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::StorageConfig;
    use crate::harness::{BrokenCache, FaultyRemote};
    use crate::storage::memory::{MemoryCache, MemoryFallback, MemoryRemoteStore};

    #[tokio::test]
    async fn test_all_healthy() {
        let core = StorageCore::new(
            StorageConfig::default(),
            Some(Arc::new(MemoryRemoteStore::new())),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryFallback::new()),
        );
        let mut events = core.subscribe();
        let mut watcher = core.health_receiver();

        let health = core.health_check().await;
        assert!(health.all_healthy());
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), health);
        assert!(health.authoritative_latency_ms.is_some());
        assert_eq!(core.last_health(), health);
        assert!(matches!(events.try_recv(), Ok(StorageEvent::HealthChanged(_))));
    }

    #[tokio::test]
    async fn test_single_failure_flags_tier() {
        let remote = Arc::new(FaultyRemote::new(MemoryRemoteStore::new()));
        let core = StorageCore::new(
            StorageConfig::default(),
            Some(remote.clone()),
            Arc::new(BrokenCache),
            Arc::new(MemoryFallback::new()),
        );
        remote.set_outage(true);

        let health = core.health_check().await;
        assert!(!health.authoritative);
        assert!(!health.cache);
        assert!(health.fallback);

        remote.set_outage(false);
        assert!(core.health_check().await.authoritative);
    }

    #[tokio::test]
    async fn test_offline_core_reports_remote_unhealthy() {
        let core = StorageCore::new(
            StorageConfig::default(),
            None,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryFallback::new()),
        );
        let health = core.health_check().await;
        assert!(!health.authoritative);
        assert!(health.cache && health.fallback);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let core = Arc::new(StorageCore::new(
            StorageConfig::default(),
            None,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryFallback::new()),
        ));
        let cancel = CancellationToken::new();
        let task = {
            let core = core.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { core.run_health_monitor(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(core.last_health().checked_at.is_some());
    }
}
