//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `route`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `route`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_account_fallbacks_total` (counter)
//! - `gateway_pool_resets_total` (counter)
//!
//! `gateway_token_refreshes_total{outcome}` is emitted by the token broker.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 50ms to 10min, matching the upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `gateway_request_duration_seconds` gets explicit buckets so it renders as
/// a histogram with `_bucket` lines rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request by matched route and response status.
pub fn record_request(route: &str, status: u16, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "route" => route.to_string(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// Record a classified upstream failure.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a retry on a different account or model.
pub fn record_fallback() {
    metrics::counter!("gateway_account_fallbacks_total").increment(1);
}

/// Record a pool-wide cooldown reset.
pub fn record_pool_reset() {
    metrics::counter!("gateway_pool_resets_total").increment(1);
}
