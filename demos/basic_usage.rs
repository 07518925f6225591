// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic storage-resilience usage example.
//!
//! Demonstrates:
//! 1. Wiring a SQLite cache and file fallback behind an in-memory remote
//! 2. Writing and reading while the remote is up
//! 3. Writing through a simulated outage
//! 4. Health check, emergency backup and catch-up sync
//! 5. Restoring from a backup
//! 6. Displaying metrics and clean shutdown
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=storage_resilience=debug cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use storage_resilience::harness::FaultyRemote;
use storage_resilience::storage::{FileFallback, MemoryRemoteStore, SqlCache};
use storage_resilience::{ResilienceConfig, ResilienceService, RestoreOptions, SyncMode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║        storage-resilience: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Wire the tiers
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    println!("📦 Local tiers under {}", dir.path().display());

    let remote = Arc::new(FaultyRemote::new(MemoryRemoteStore::new()));
    let cache = Arc::new(SqlCache::open_file(dir.path().join("cache.db")).await?);
    let fallback = Arc::new(FileFallback::open(dir.path().join("fallback")).await?);

    let mut config = ResilienceConfig::default();
    config.sync.mode = SyncMode::Manual;
    config.storage.remote_timeout_ms = 500;

    let service = ResilienceService::new(config, Some(remote.clone()), cache, fallback)?;
    service.start();
    println!("   State: {}", service.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Normal operation
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing 3 orders with the remote up...");
    for i in 1..=3 {
        let report = service.core().set("orders", &format!("o{}", i), json!({"total": i * 100})).await?;
        println!(
            "   └─ o{} v{} → {}",
            i,
            report.item.metadata.version,
            if report.propagated() { "propagated" } else { "local only" }
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Outage
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💥 Remote goes down, writes keep working...");
    remote.set_outage(true);
    service.core().set("orders", "o4", json!({"total": 400})).await?;
    let outcome = service.core().read("orders", "o4").await?;
    println!("   └─ o4 served by {:?}", outcome.served_by);

    let status = service.recovery().force_health_check().await;
    println!("   Health: {:?}, {} active failure(s)", status.overall, status.active_failures.len());
    for failure in &status.active_failures {
        println!("   └─ {} [{}] {}", failure.failure_type, failure.severity, failure.description);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Recovery
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔧 Remote comes back, catching up...");
    remote.set_outage(false);
    let report = service.sync().perform_full_sync().await;
    println!("   └─ synced {} conflicts {} errors {}", report.synced(), report.conflicts(), report.errors());

    let status = service.recovery().force_health_check().await;
    println!("   Health: {:?}", status.overall);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Backups
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n💾 Backups:");
    let backup = service.backups().create_manual_backup("demo", Some("before cleanup")).await;
    for meta in service.backups().list_backups().await? {
        println!("   └─ {} {} ({}, {} items, {} bytes)", meta.name, meta.status, meta.backup_type, meta.item_count, meta.size);
    }

    service.core().delete("orders", "o1").await?;
    let restored = service
        .backups()
        .restore_backup(&backup.id, RestoreOptions::default())
        .await?;
    println!("   Restored {} item(s), o1 = {:?}", restored.restored(), service.core().get("orders", "o1").await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    service.stop().await;
    println!("\n✅ Stopped. State: {}", service.state());
    Ok(())
}

/// Dump captured metrics sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("{}{} = {}", key.name(), label_str, rendered));
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
