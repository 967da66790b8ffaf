// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for cache-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `cache_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `collection`: document-store collection of the mapping
//! - `op`: SET, DEL
//! - `outcome` / `status`: filled, absent, failed, persisted, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::backpressure::BackpressureLevel;
use crate::resilience::circuit_breaker::CircuitState;

// ═══════════════════════════════════════════════════════════════════════════
// READ-THROUGH
// ═══════════════════════════════════════════════════════════════════════════

/// Record the final outcome of a miss fill
pub fn record_fill(collection: &str, outcome: &str, attempts: u32) {
    counter!(
        "cache_sync_fills_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "cache_sync_fill_attempts",
        "collection" => collection.to_string()
    )
    .record(f64::from(attempts));
}

/// Record fill latency (all attempts, including backoff)
pub fn record_fill_latency(collection: &str, duration: Duration) {
    histogram!(
        "cache_sync_fill_seconds",
        "collection" => collection.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A miss arrived while the same key was already being filled
pub fn record_fill_coalesced(collection: &str) {
    counter!(
        "cache_sync_fills_coalesced_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Our own fill SET came back as a change event and was skipped
pub fn record_echo_suppressed(collection: &str) {
    counter!(
        "cache_sync_fill_echoes_suppressed_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE-BEHIND
// ═══════════════════════════════════════════════════════════════════════════

/// Record a queue enqueue and how it was absorbed
pub fn record_enqueue(collection: &str, outcome: &str) {
    counter!(
        "cache_sync_enqueued_total",
        "collection" => collection.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a persistence attempt
pub fn record_persist(collection: &str, op: &str, status: &str) {
    counter!(
        "cache_sync_persists_total",
        "collection" => collection.to_string(),
        "op" => op.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record persistence latency of a single attempt
pub fn record_persist_latency(collection: &str, duration: Duration) {
    histogram!(
        "cache_sync_persist_seconds",
        "collection" => collection.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the number of entries a worker pulled in one batch
pub fn record_batch_size(collection: &str, count: usize) {
    histogram!(
        "cache_sync_batch_size",
        "collection" => collection.to_string()
    )
    .record(count as f64);
}

/// Record an unparseable payload that was dropped
pub fn record_poison(collection: &str) {
    counter!(
        "cache_sync_poison_entries_total",
        "collection" => collection.to_string()
    )
    .increment(1);
}

/// Record an entry moved to the dead-letter log
pub fn record_dead_letter(collection: &str, reason: &str) {
    counter!(
        "cache_sync_dead_letters_total",
        "collection" => collection.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set pending keys in a queue
pub fn set_queue_depth(collection: &str, depth: usize) {
    gauge!(
        "cache_sync_queue_depth",
        "collection" => collection.to_string()
    )
    .set(depth as f64);
}

/// Set queue backpressure level (0 = Normal .. 3 = Critical)
pub fn set_backpressure_level(collection: &str, level: BackpressureLevel) {
    gauge!(
        "cache_sync_backpressure_level",
        "collection" => collection.to_string()
    )
    .set(level as u8 as f64);
}

/// Record entries restored from the write-ahead log at startup
pub fn record_wal_replay(count: usize) {
    counter!("cache_sync_wal_replayed_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS & RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error by component and kind
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "cache_sync_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change
pub fn set_circuit_state(circuit: &str, state: CircuitState) {
    gauge!(
        "cache_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as u8 as f64);
}

/// Record a call through a circuit breaker
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "cache_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache event received by the router
pub fn record_cache_event(kind: &str, routed: bool) {
    counter!(
        "cache_sync_cache_events_total",
        "kind" => kind.to_string(),
        "routed" => if routed { "true" } else { "false" }
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "cache_sync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("cache_sync_startup_total_seconds").record(duration.as_secs_f64());
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "cache_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    collection: String,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str, collection: impl Into<String>) -> Self {
        Self {
            operation,
            collection: collection.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "cache_sync_operation_seconds",
            "operation" => self.operation,
            "collection" => self.collection.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
