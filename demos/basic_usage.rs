// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic usage example for cache-sync.
//!
//! Runs the engine over the in-memory cache and store, so no services are
//! needed. Demonstrates:
//! - Filling a cache miss from the document store
//! - Writing cache SET / DEL behind to the store
//! - Synchronous write-through and read-through
//! - Engine stats and captured metrics
//!
//! Run with: `cargo run --example basic_usage`

use std::sync::Arc;
use std::time::Duration;

use cache_sync::{
    CacheClient, InMemoryCache, InMemoryStore, Mapping, SyncEngine, SyncEngineConfig, WriteMode,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("╔═══════════════════════════════════════════════════════════════╗");
    println!("║              cache-sync: Basic Usage Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // =========================================================================
    // 1. Configure and start
    // =========================================================================
    println!("🔧 Configuring engine...");
    let cache = Arc::new(InMemoryCache::new());
    let store = Arc::new(InMemoryStore::new());

    store.insert("users", "alice", json!({"userID": "alice", "name": "Alice", "plan": "pro"}));

    let config = SyncEngineConfig {
        mappings: vec![
            Mapping::new("UserEntity:", "users", "userID"),
            Mapping::new("TransactionEntity:", "transactions", "transactionID")
                .with_write_mode(WriteMode::Through),
        ],
        poll_interval_ms: 20,
        fill_ttl_secs: Some(300),
        // In-memory queue for the demo; leave the default for a durable log
        wal_path: None,
        ..Default::default()
    };

    let mut engine = SyncEngine::new(config, cache.clone(), store.clone())?;
    engine.start().await?;
    println!("   └─ State: {:?}, mappings: {}\n", engine.state(), engine.mappings().len());

    // =========================================================================
    // 2. Cache miss filled from the store
    // =========================================================================
    println!("📖 Reading UserEntity:alice through the engine...");
    match engine.read_through("UserEntity:alice").await? {
        Some(bytes) => println!("   └─ Filled: {}", String::from_utf8_lossy(&bytes)),
        None => println!("   └─ Not in store"),
    }
    match cache.ttl("UserEntity:alice") {
        Some(ttl) => println!("   └─ Cache TTL: {}s\n", ttl.as_secs()),
        None => println!("   └─ Cache TTL: none\n"),
    }

    // =========================================================================
    // 3. Cache writes persisted behind
    // =========================================================================
    println!("📝 Writing UserEntity:bob straight to the cache...");
    cache
        .set("UserEntity:bob", br#"{"userID":"bob","name":"Bob","plan":"free"}"#)
        .await?;
    cache
        .set("UserEntity:bob", br#"{"userID":"bob","name":"Bob","plan":"team"}"#)
        .await?;
    wait_for(|| store.record("users", "bob").is_some()).await;
    println!("   └─ Store now holds: {:?}", store.record("users", "bob"));

    println!("🗑️  Deleting UserEntity:bob from the cache...");
    cache.delete("UserEntity:bob").await?;
    wait_for(|| store.record("users", "bob").is_none()).await;
    println!("   └─ Store record removed: {}\n", store.record("users", "bob").is_none());

    // =========================================================================
    // 4. Write-through
    // =========================================================================
    println!("💳 Writing TransactionEntity:t-100 through the engine...");
    engine
        .write_through(
            "TransactionEntity:t-100",
            br#"{"transactionID":"t-100","amount":42,"currency":"EUR"}"#,
        )
        .await?;
    println!("   └─ Store: {:?}", store.record("transactions", "t-100"));
    println!(
        "   └─ Cache: {:?}\n",
        cache.raw("TransactionEntity:t-100").map(|b| String::from_utf8_lossy(&b).into_owned())
    );

    // =========================================================================
    // 5. Stats and metrics
    // =========================================================================
    let stats = engine.stats();
    println!("📊 Engine stats:");
    println!("   ├─ filled:            {}", stats.filled);
    println!("   ├─ persisted:         {}", stats.persisted);
    println!("   ├─ coalesced:         {}", stats.coalesced);
    println!("   ├─ echoes suppressed: {}", stats.echoes_suppressed);
    println!("   ├─ dead lettered:     {}", stats.dead_lettered);
    println!("   └─ queue depth:       {} ({:?})\n", stats.queue_depth, engine.pressure());

    println!("📈 Captured metrics:");
    dump_metrics(&snapshotter);

    // =========================================================================
    // 6. Shutdown
    // =========================================================================
    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   └─ State: {:?}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Poll until `done` holds, giving up after two seconds.
async fn wait_for(done: impl Fn() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Dump all captured metrics grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = vec![];
    let mut gauges = vec![];
    let mut histograms = vec![];

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = format!("{}{}", key.name(), label_str);

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, value) in &counters {
            println!("   │  └─ {} = {}", name, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, value) in &gauges {
            println!("   │  └─ {} = {:.2}", name, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, count, avg) in &histograms {
            println!("      └─ {} count={} avg={:.4}s", name, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
