// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for batch-vault.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `batch_vault_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size values
//!
//! # Labels
//! - `backend`: ephemeral, fast-local, bulk-local, remote-server, remote-object
//! - `operation`: read, write, delete
//! - `status`: success, error, miss

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::resilience::circuit_breaker::CircuitState;

// ═══════════════════════════════════════════════════════════════════════════
// ROUTER OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a storage operation outcome against a backend
pub fn record_operation(backend: &str, operation: &str, status: &str) {
    counter!(
        "batch_vault_operations_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "batch_vault_operation_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record bytes written to a tier
pub fn record_bytes_written(backend: &str, bytes: u64) {
    counter!(
        "batch_vault_bytes_written_total",
        "backend" => backend.to_string()
    )
    .increment(bytes);
}

/// Record an ephemeral-tier hit or miss
pub fn record_cache(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "batch_vault_cache_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a write that moved past its first-choice backend
pub fn record_fallback(failed_backend: &str) {
    counter!(
        "batch_vault_write_fallbacks_total",
        "backend" => failed_backend.to_string()
    )
    .increment(1);
}

/// Record a read-promotion into the ephemeral tier
pub fn record_promotion(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "batch_vault_promotions_total",
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH & CAPACITY
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "batch_vault_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a health probe's latency
pub fn record_probe_latency(backend: &str, duration: Duration) {
    histogram!(
        "batch_vault_probe_seconds",
        "backend" => backend.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set quota usage ratio (0.0 - 1.0)
pub fn set_quota_usage(backend: &str, ratio: f64) {
    gauge!(
        "batch_vault_quota_usage_ratio",
        "backend" => backend.to_string()
    )
    .set(ratio);
}

/// Record a tier crossing its quota warning threshold
pub fn record_quota_warning(backend: &str) {
    counter!(
        "batch_vault_quota_warnings_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set ephemeral tier item count
pub fn set_ephemeral_items(count: usize) {
    gauge!("batch_vault_ephemeral_items").set(count as f64);
}

/// Record entries reclaimed by cleanup or sweep
pub fn record_reclaimed(backend: &str, count: usize) {
    counter!(
        "batch_vault_reclaimed_entries_total",
        "backend" => backend.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// RESILIENCE
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state change
pub fn set_circuit_state(circuit: &str, state: CircuitState) {
    gauge!(
        "batch_vault_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as u8 as f64);
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "batch_vault_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retry decision (retry, recovered, exhausted)
pub fn record_retry(operation: &str, outcome: &str) {
    counter!(
        "batch_vault_retries_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECOVERY
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished recovery attempt
pub fn record_recovery(status: &str, duration: Duration) {
    counter!(
        "batch_vault_recoveries_total",
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("batch_vault_recovery_seconds").record(duration.as_secs_f64());
}

/// Record a field conflict between sources
pub fn record_conflict(field: &str, resolution: &str) {
    counter!(
        "batch_vault_conflicts_total",
        "field" => field.to_string(),
        "resolution" => resolution.to_string()
    )
    .increment(1);
}

/// Record a stored checksum that no longer matches its state
pub fn record_divergence(source: &str) {
    counter!(
        "batch_vault_divergence_detected_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Set number of recoveries currently in flight
pub fn set_recoveries_in_flight(count: usize) {
    gauge!("batch_vault_recoveries_in_flight").set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.backend, self.operation, self.start.elapsed());
    }
}
