//! Connectivity monitor for adaptive scheduling.
//!
//! Samples network reachability (TCP connect to `network_probe_addr`) and
//! authoritative reachability (tier ping). After `offline_after_failures`
//! consecutive failed samples realtime is paused; the first good sample
//! afterwards resumes it and forces a full sync.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::ConnectivityState;
use super::SyncEngine;
use crate::metrics;

const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl SyncEngine {
    #[must_use]
    pub fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.borrow()
    }

    #[must_use]
    pub fn connectivity_receiver(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    async fn network_reachable(&self) -> bool {
        let Some(addr) = self.config.network_probe_addr.as_deref() else {
            return true;
        };
        match tokio::time::timeout(NETWORK_PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr, error = %e, "Network probe failed");
                false
            }
            Err(_) => {
                debug!(addr, "Network probe timed out");
                false
            }
        }
    }

    /// Both the network and the authoritative tier answer.
    pub async fn check_connectivity(&self) -> bool {
        self.network_reachable().await && self.core.probe_remote().await.is_ok()
    }

    /// Take one sample and apply the online/offline transition rules.
    pub async fn sample_connectivity(&self) -> ConnectivityState {
        let reachable = self.check_connectivity().await;
        let current = self.connectivity();

        if reachable {
            self.failed_samples.store(0, Ordering::Relaxed);
            if current == ConnectivityState::Offline {
                info!("Connectivity restored, resuming realtime sync");
                self.core.circuit().reset();
                self.connectivity.send_replace(ConnectivityState::Online);
                metrics::set_sync_online(true);
                let report = self.perform_full_sync().await;
                info!(synced = report.synced(), errors = report.errors(), "Catch-up sync after reconnect");
            }
            return ConnectivityState::Online;
        }

        let failures = self.failed_samples.fetch_add(1, Ordering::Relaxed) + 1;
        if current == ConnectivityState::Online && failures >= self.config.offline_after_failures.max(1) {
            warn!(failures, "Authoritative tier unreachable, pausing realtime sync");
            self.connectivity.send_replace(ConnectivityState::Offline);
            metrics::set_sync_online(false);
        } else {
            debug!(failures, "Connectivity sample failed");
        }
        self.connectivity()
    }

    /// Sample on a fixed interval until cancelled.
    pub async fn run_connectivity_monitor(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.connectivity_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sample_connectivity().await;
                }
            }
        }
        debug!("Connectivity monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::tests::engine_with;
    use super::*;
    use crate::sync::types::ConflictStrategy;

    #[tokio::test]
    async fn test_offline_after_consecutive_failures_then_catch_up() {
        let (engine, remote) = engine_with(ConflictStrategy::LastWins);
        let mut watcher = engine.connectivity_receiver();
        remote.set_outage(true);
        engine.core().set("orders", "o1", json!({"total": 1})).await.unwrap();

        assert_eq!(engine.sample_connectivity().await, ConnectivityState::Online);
        assert_eq!(engine.sample_connectivity().await, ConnectivityState::Offline);
        assert_eq!(*watcher.borrow_and_update(), ConnectivityState::Offline);
        assert!(engine.process_queue().await.skipped);

        remote.set_outage(false);
        assert_eq!(engine.sample_connectivity().await, ConnectivityState::Online);
        // Reconnect forced a full sync
        assert!(remote.inner().row("orders", "o1").is_some());
    }

    #[tokio::test]
    async fn test_unreachable_probe_address() {
        let (engine, _) = engine_with(ConflictStrategy::LastWins);
        let mut config = engine.config().clone();
        // Port 1 on loopback is closed in test environments
        config.network_probe_addr = Some("127.0.0.1:1".into());
        let engine = SyncEngine::new(engine.core().clone(), config);

        assert!(!engine.check_connectivity().await);
    }
}
