//! # Metrics
//!
//! Thin helpers over the `metrics` facade so metric names and labels are
//! defined in one place. Without an installed recorder every call is a no-op,
//! which keeps tests and library use free of global setup.
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `proxy_requests_total` | counter | `endpoint`, `cache` |
//! | `proxy_upstream_attempts_total` | counter | `endpoint`, `outcome` |
//! | `proxy_upstream_latency_seconds` | histogram | `endpoint` |
//! | `proxy_batch_flushes_total` | counter | `trigger` |
//! | `proxy_batch_size` | histogram | |
//! | `proxy_rate_limited_total` | counter | `endpoint` |

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub const REQUESTS_TOTAL: &str = "proxy_requests_total";
pub const UPSTREAM_ATTEMPTS_TOTAL: &str = "proxy_upstream_attempts_total";
pub const UPSTREAM_LATENCY_SECONDS: &str = "proxy_upstream_latency_seconds";
pub const BATCH_FLUSHES_TOTAL: &str = "proxy_batch_flushes_total";
pub const BATCH_SIZE: &str = "proxy_batch_size";
pub const RATE_LIMITED_TOTAL: &str = "proxy_rate_limited_total";

const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to initialize metrics exporter: {0}")]
    Initialization(String),
}

/// Install the Prometheus recorder and return the handle used to render `/metrics`
pub fn install_prometheus() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(UPSTREAM_LATENCY_SECONDS.to_string()),
            LATENCY_BUCKETS,
        )
        .map_err(|e| MetricsError::Initialization(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Initialization(e.to_string()))
}

/// One proxied request, labelled with how it was served
pub fn record_request(endpoint: &str, cache: &'static str) {
    metrics::counter!(REQUESTS_TOTAL, "endpoint" => endpoint.to_string(), "cache" => cache)
        .increment(1);
}

/// One upstream attempt and its classification (`ok`, `server_error`, `timeout`, ...)
pub fn record_upstream_attempt(endpoint: &str, outcome: &'static str, latency: Duration) {
    metrics::counter!(
        UPSTREAM_ATTEMPTS_TOTAL,
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(UPSTREAM_LATENCY_SECONDS, "endpoint" => endpoint.to_string())
        .record(latency.as_secs_f64());
}

/// One batch flush, by what triggered it
pub fn record_batch_flush(trigger: &'static str, ids: usize) {
    metrics::counter!(BATCH_FLUSHES_TOTAL, "trigger" => trigger).increment(1);
    metrics::histogram!(BATCH_SIZE).record(ids as f64);
}

pub fn record_rate_limited(endpoint: &str) {
    metrics::counter!(RATE_LIMITED_TOTAL, "endpoint" => endpoint.to_string()).increment(1);
}
