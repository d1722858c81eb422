//! Prometheus metrics for the relay.

use crate::hls::rewrite::RewriteStats;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder, once per process.
///
/// Later calls return the handle from the first install.
pub fn install() -> Result<PrometheusHandle, String> {
    if let Some(handle) = HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        // Lost a race with another installer
        Err(e) => return HANDLE.get().cloned().ok_or_else(|| e.to_string()),
    };
    Ok(HANDLE.get_or_init(|| handle).clone())
}

pub fn record_request(endpoint: &'static str, status: u16) {
    counter!(
        "hls_relay_requests_total",
        "endpoint" => endpoint,
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_duration(endpoint: &'static str, start: Instant) {
    histogram!("hls_relay_request_duration_seconds", "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_upstream_error() {
    counter!("hls_relay_upstream_errors_total").increment(1);
}

pub fn record_token_failure(kind: &'static str) {
    counter!("hls_relay_token_failures_total", "kind" => kind).increment(1);
}

/// Count rewritten references by role
pub fn record_rewrite(stats: &RewriteStats) {
    for (kind, count) in [
        ("playlist", stats.playlists),
        ("segment", stats.segments),
        ("key", stats.keys),
        ("skipped", stats.skipped),
    ] {
        if count > 0 {
            counter!("hls_relay_rewritten_lines_total", "kind" => kind).increment(count as u64);
        }
    }
}
