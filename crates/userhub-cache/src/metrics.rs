//! Prometheus metrics for the cache layer.
//!
//! Counters are emitted through the `metrics` facade and are no-ops until a
//! recorder is installed with [`init_metrics`].

use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Cache-aside reads
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_STORE_LOADS_TOTAL: &str = "cache_store_loads_total";
    pub const CACHE_COALESCED_TOTAL: &str = "cache_coalesced_total";
    pub const CACHE_WRITE_FAILURES_TOTAL: &str = "cache_write_failures_total";

    // Locks
    pub const LOCK_ACQUIRE_TOTAL: &str = "lock_acquire_total";

    // Connector
    pub const REDIS_CONNECT_ATTEMPTS_TOTAL: &str = "redis_connect_attempts_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache hit. `kind` is `"entry"` or `"tombstone"`.
pub fn record_cache_hit(kind: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "kind" => kind).increment(1);
}

/// Record a cache miss (absent, unreadable or undecodable entry).
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a load that reached the store.
pub fn record_store_load() {
    counter!(names::CACHE_STORE_LOADS_TOTAL).increment(1);
}

/// Record a caller that joined another caller's load.
pub fn record_coalesced() {
    counter!(names::CACHE_COALESCED_TOTAL).increment(1);
}

/// Record a swallowed failure on a best-effort path.
pub fn record_cache_write_failure(op: &'static str) {
    counter!(names::CACHE_WRITE_FAILURES_TOTAL, "op" => op).increment(1);
}

// =============================================================================
// Lock / Connector Metrics
// =============================================================================

/// Record the outcome of a lock acquisition: `"acquired"`, `"busy"`, `"error"`, `"cancelled"`.
pub fn record_lock_acquire(outcome: &'static str) {
    counter!(names::LOCK_ACQUIRE_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a connection attempt: `"ok"`, `"retryable"`, `"fatal"`.
pub fn record_connect_attempt(outcome: &'static str) {
    counter!(names::REDIS_CONNECT_ATTEMPTS_TOTAL, "outcome" => outcome).increment(1);
}
