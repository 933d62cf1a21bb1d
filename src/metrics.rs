// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for record-search.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `record_search_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: indexed, bulk
//! - `operation`: execute, count, ping, total_records
//! - `status`: success, error, timeout, rejected

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// SEARCHES - Request-level outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed or failed search
pub fn record_search(status: &str, fast_path: bool) {
    counter!(
        "record_search_searches_total",
        "status" => status.to_string(),
        "path" => if fast_path { "fast" } else { "mixed" }.to_string()
    )
    .increment(1);
}

/// Record end-to-end search latency
pub fn record_search_latency(duration: Duration) {
    histogram!("record_search_search_seconds").record(duration.as_secs_f64());
}

/// Record the size of a returned page
pub fn record_search_results(count: usize) {
    histogram!("record_search_page_size").record(count as f64);
}

/// Record a request rejected before planning
pub fn record_validation_rejected(constraint: &str) {
    counter!(
        "record_search_validation_rejected_total",
        "constraint" => constraint.to_string()
    )
    .increment(1);
}

/// Record a search answered with fewer backends than planned
pub fn record_degraded(backend: &str) {
    counter!(
        "record_search_degraded_total",
        "missing_backend" => backend.to_string()
    )
    .increment(1);
}

/// Record an identifier returned by both stores with conflicting attributes
pub fn record_identifier_collision() {
    counter!("record_search_identifier_collisions_total").increment(1);
}

/// Set the 24h search volume
pub fn set_searches_last_24h(count: u64) {
    gauge!("record_search_searches_last_24h").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND CALLS - Per-store operations
// ═══════════════════════════════════════════════════════════════════════════

/// Record a backend call outcome
pub fn record_backend_call(backend: &str, operation: &str, status: &str) {
    counter!(
        "record_search_backend_calls_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record backend call latency
pub fn record_backend_latency(backend: &str, operation: &str, duration: Duration) {
    histogram!(
        "record_search_backend_seconds",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record chunk size pulled from a streaming scan
pub fn record_chunk_rows(backend: &str, rows: usize) {
    histogram!(
        "record_search_chunk_rows",
        "backend" => backend.to_string()
    )
    .record(rows as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record a deadline exceeded
pub fn record_timeout(backend: &str, operation: &str) {
    counter!(
        "record_search_timeouts_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a pool acquire that gave up
pub fn record_pool_exhausted(pool: &str) {
    counter!(
        "record_search_pool_exhausted_total",
        "pool" => pool.to_string()
    )
    .increment(1);
}

/// Record a connection failure
pub fn record_connection_error(backend: &str) {
    counter!(
        "record_search_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKEND HEALTH - Reachability
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend reachability (1 = reachable, 0 = unreachable)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "record_search_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker state (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "record_search_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a call through a circuit breaker
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "record_search_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STARTUP - Timing for cold start monitoring
// ═══════════════════════════════════════════════════════════════════════════

/// Record how long one connect phase took
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "record_search_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records backend latency on drop
pub struct LatencyTimer {
    backend: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(backend: &'static str, operation: &'static str) -> Self {
        Self {
            backend,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_backend_latency(self.backend, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These verify the API doesn't panic without a recorder installed.

    #[test]
    fn test_search_metrics() {
        record_search("success", true);
        record_search("error", false);
        record_search_latency(Duration::from_millis(12));
        record_search_results(100);
        record_search_results(0);
        record_validation_rejected("limit");
        set_searches_last_24h(42);
    }

    #[test]
    fn test_backend_metrics() {
        record_backend_call("indexed", "execute", "success");
        record_backend_call("bulk", "count", "timeout");
        record_backend_latency("bulk", "execute", Duration::from_millis(50));
        record_chunk_rows("bulk", 1000);
    }

    #[test]
    fn test_error_metrics() {
        record_timeout("bulk", "execute");
        record_pool_exhausted("indexed");
        record_connection_error("bulk");
        record_degraded("bulk");
        record_identifier_collision();
    }

    #[test]
    fn test_health_and_circuit_metrics() {
        set_backend_healthy("indexed", true);
        set_backend_healthy("bulk", false);
        set_circuit_state("bulk", 2);
        record_circuit_breaker_call("indexed", "success");
        record_circuit_breaker_call("bulk", "rejected");
        record_startup_phase("connect_indexed", Duration::from_millis(3));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("indexed", "execute");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Recorded on drop
    }
}
