// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for sensor-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `sensor_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: local, remote
//! - `operation`: insert, upsert, update, delete, get_by_id, get_by_project, exists, scan, set_synced
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a tier operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "sensor_sync_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "sensor_sync_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a tier call abandoned by the governor
pub fn record_timeout(tier: &str, operation: &str) {
    counter!(
        "sensor_sync_timeouts_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record time spent waiting for a tier permit
pub fn record_permit_wait(tier: &str, duration: Duration) {
    histogram!(
        "sensor_sync_permit_wait_seconds",
        "tier" => tier.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a remote read that degraded to the local tier
pub fn record_fallback(operation: &str) {
    counter!(
        "sensor_sync_read_fallbacks_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record rows written to a tier
pub fn record_items_written(tier: &str, count: usize) {
    counter!(
        "sensor_sync_items_written_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIVITY
// ═══════════════════════════════════════════════════════════════════════════

/// Record one reachability probe and its verdict
pub fn record_connectivity_probe(online: bool) {
    let verdict = if online { "online" } else { "offline" };
    counter!(
        "sensor_sync_connectivity_probes_total",
        "verdict" => verdict
    )
    .increment(1);
    gauge!("sensor_sync_online").set(if online { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record the remote half of a write (confirmed, offline, failed)
pub fn record_remote_outcome(operation: &str, outcome: &str) {
    counter!(
        "sensor_sync_remote_writes_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one reconciliation cycle
pub fn record_reconcile_cycle(scanned: usize, synced: usize, failed: usize, duration: Duration) {
    counter!("sensor_sync_reconcile_cycles_total").increment(1);
    counter!("sensor_sync_reconcile_synced_total").increment(synced as u64);
    counter!("sensor_sync_reconcile_failed_total").increment(failed as u64);
    histogram!("sensor_sync_reconcile_scanned").record(scanned as f64);
    histogram!("sensor_sync_reconcile_seconds").record(duration.as_secs_f64());
}

/// Record a cycle skipped because the device is offline
pub fn record_reconcile_skipped() {
    counter!("sensor_sync_reconcile_skipped_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLISHER
// ═══════════════════════════════════════════════════════════════════════════

/// Record what happened to one outbound message.
///
/// Outcomes: enqueued, published, dropped_full, dropped_disconnected, dropped_publish_error
pub fn record_publish(outcome: &str) {
    counter!(
        "sensor_sync_publish_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set current publish queue depth
pub fn set_publish_queue_depth(depth: usize) {
    gauge!("sensor_sync_publish_queue_depth").set(depth as f64);
}

/// Record a bus (re)connection attempt
pub fn record_bus_connect(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "sensor_sync_bus_connects_total",
        "status" => status
    )
    .increment(1);
    gauge!("sensor_sync_bus_connected").set(if success { 1.0 } else { 0.0 });
}

/// Mark the bus link as down
pub fn set_bus_disconnected() {
    gauge!("sensor_sync_bus_connected").set(0.0);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "sensor_sync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record total startup time
pub fn record_startup_total(duration: Duration) {
    histogram!("sensor_sync_startup_total_seconds").record(duration.as_secs_f64());
}

/// Count state machine transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "sensor_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set backend health (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "sensor_sync_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
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
