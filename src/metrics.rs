// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade; the embedding application installs the
//! exporter (Prometheus, OTEL, ...). Without a recorder every call is a no-op.
//!
//! # Naming
//! - `storage_resilience_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `tier`: authoritative, cache, fallback
//! - `operation`: get, set, delete, list, sync, backup, restore
//! - `status`: success, error, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "storage_resilience_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "storage_resilience_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "storage_resilience_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Write that landed in a lower tier because the authoritative one failed.
pub fn record_propagation_failure(collection: &str) {
    counter!(
        "storage_resilience_propagation_failures_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Read served by a tier other than the first one tried.
pub fn record_read_fallback(tier: &str) {
    counter!(
        "storage_resilience_read_fallbacks_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

pub fn set_tier_healthy(tier: &str, healthy: bool) {
    gauge!(
        "storage_resilience_tier_healthy",
        "tier" => tier.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// 0 = closed, 1 = half-open, 2 = open
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "storage_resilience_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "storage_resilience_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_corruption(collection: &str) {
    counter!(
        "storage_resilience_corruption_detected_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Outcome of reconciling one item: pushed, pulled, conflict, skipped, error.
pub fn record_sync_item(outcome: &str) {
    counter!(
        "storage_resilience_sync_items_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_sync_duration(duration: Duration) {
    histogram!("storage_resilience_sync_seconds").record(duration.as_secs_f64());
}

pub fn set_sync_queue_len(len: usize) {
    gauge!("storage_resilience_sync_queue_items").set(len as f64);
}

pub fn set_unresolved_conflicts(count: usize) {
    gauge!("storage_resilience_unresolved_conflicts").set(count as f64);
}

pub fn set_sync_online(online: bool) {
    gauge!("storage_resilience_sync_online").set(if online { 1.0 } else { 0.0 });
}

pub fn record_backup(backup_type: &str, status: &str) {
    counter!(
        "storage_resilience_backups_total",
        "type" => backup_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_backup_bytes(bytes: u64) {
    histogram!("storage_resilience_backup_bytes").record(bytes as f64);
}

pub fn record_restore(status: &str, items: usize) {
    counter!(
        "storage_resilience_restores_total",
        "status" => status.to_string()
    )
    .increment(1);
    counter!("storage_resilience_restored_items_total").increment(items as u64);
}

pub fn record_failure_event(failure_type: &str, severity: &str) {
    counter!(
        "storage_resilience_failure_events_total",
        "type" => failure_type.to_string(),
        "severity" => severity.to_string()
    )
    .increment(1);
}

pub fn record_recovery_attempt(strategy: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "storage_resilience_recovery_attempts_total",
        "strategy" => strategy.to_string(),
        "status" => status
    )
    .increment(1);
}

pub fn set_service_state(state: &str) {
    for s in ["created", "starting", "running", "shutting_down", "stopped"] {
        gauge!("storage_resilience_service_state", "state" => s)
            .set(if s == state { 1.0 } else { 0.0 });
    }
}

/// Overall health as reported by the recovery orchestrator.
pub fn set_overall_health(overall: &str) {
    for s in ["healthy", "degraded", "critical"] {
        gauge!("storage_resilience_overall_health", "status" => s)
            .set(if s == overall { 1.0 } else { 0.0 });
    }
}

/// Records latency on drop.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
