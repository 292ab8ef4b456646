//! Prometheus metrics for the Herald service.
//!
//! Cache-tier metrics are recorded by `herald-cache`; this module installs
//! the recorder and records request and source-level metrics.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use herald_core::HeraldError;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const REPORT_REQUESTS_TOTAL: &str = "herald_report_requests_total";
    pub const REPORT_REQUEST_DURATION_SECONDS: &str = "herald_report_request_duration_seconds";
    pub const SOURCE_FETCHES_TOTAL: &str = "herald_source_fetches_total";
    pub const SOURCE_FETCH_DURATION_SECONDS: &str = "herald_source_fetch_duration_seconds";
    pub const SOURCE_ROWS: &str = "herald_source_rows";

    pub use herald_cache::metrics::names::*;
}

/// Installs the Prometheus recorder. Returns `false` if already installed or on failure.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
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

/// Current metrics in Prometheus text format, `None` before [`init_metrics`].
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// Record one report request.
pub fn record_report_request(
    endpoint: &str,
    result: Result<bool, &HeraldError>,
    duration: Duration,
) {
    let outcome = match result {
        Ok(true) => "cached",
        Ok(false) => "fresh",
        Err(e) if e.is_client_error() => "client_error",
        Err(_) => "error",
    };
    counter!(
        names::REPORT_REQUESTS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(names::REPORT_REQUEST_DURATION_SECONDS, "endpoint" => endpoint.to_string())
        .record(duration.as_secs_f64());
}

/// Record one source fetch.
pub fn record_source_fetch(
    source: &'static str,
    result: Result<usize, &HeraldError>,
    duration: Duration,
) {
    let outcome = match result {
        Ok(rows) => {
            histogram!(names::SOURCE_ROWS, "source" => source).record(rows as f64);
            "ok"
        }
        Err(HeraldError::SourceTimeout { .. }) => "timeout",
        Err(HeraldError::SourceUnavailable { .. }) => "unavailable",
        Err(_) => "error",
    };
    counter!(names::SOURCE_FETCHES_TOTAL, "source" => source, "outcome" => outcome).increment(1);
    histogram!(names::SOURCE_FETCH_DURATION_SECONDS, "source" => source)
        .record(duration.as_secs_f64());
}
