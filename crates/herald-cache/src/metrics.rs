//! Cache metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the binary installs a recorder.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "herald_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "herald_cache_misses_total";
    pub const CACHE_ERRORS_TOTAL: &str = "herald_cache_errors_total";
    pub const DATASET_CACHE_ENTRIES: &str = "herald_dataset_cache_entries";
    pub const DATASET_REFRESH_TOTAL: &str = "herald_dataset_refresh_total";
    pub const PROXY_PURGE_FILES_TOTAL: &str = "herald_proxy_purge_files_total";
}

/// Record a dataset cache hit.
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a dataset cache miss (absent or stale).
pub fn record_cache_miss(tier: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "tier" => tier).increment(1);
}

/// Record a store failure that was degraded to a miss.
pub fn record_cache_error(operation: &'static str) {
    counter!(names::CACHE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

pub fn set_dataset_entries(count: usize) {
    gauge!(names::DATASET_CACHE_ENTRIES).set(count as f64);
}

/// Record one endpoint's refresh outcome.
pub fn record_refresh(outcome: &'static str) {
    counter!(names::DATASET_REFRESH_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_purge(files: usize) {
    counter!(names::PROXY_PURGE_FILES_TOTAL).increment(files as u64);
}
