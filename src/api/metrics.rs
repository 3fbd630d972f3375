//! # Request Metrics
//!
//! Prometheus histogram of HTTP request durations, served on `GET /metrics`.
//!
//! Metric: `http_request_duration_ms`
//! Labels: `method`, `route` (the matched route template, `unmatched` for
//! 404s), `code`
//!
//! Durations are recorded in milliseconds with buckets from 0.1ms to 5s.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use color_eyre::eyre::{eyre, Result};
use metrics::histogram;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::{Duration, Instant};

pub const REQUEST_DURATION_METRIC: &str = "http_request_duration_ms";

const REQUEST_DURATION_BUCKETS_MS: &[f64] = &[
    0.1, 5.0, 15.0, 50.0, 100.0, 300.0, 500.0, 1000.0, 3000.0, 5000.0,
];

/// Installs the global Prometheus recorder
///
/// Must run once, before the first request is recorded. A second call fails
/// because the recorder is process-wide.
pub fn init_metrics_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_METRIC.to_string()),
            REQUEST_DURATION_BUCKETS_MS,
        )
        .map_err(|e| eyre!("Failed to set request duration buckets: {}", e))?
        .install_recorder()
        .map_err(|e| eyre!("Failed to install Prometheus metrics recorder: {}", e))
}

pub fn record_http_request(method: &str, route: &str, code: u16, duration: Duration) {
    histogram!(REQUEST_DURATION_METRIC,
        "method" => method.to_string(),
        "route" => route.to_string(),
        "code" => code.to_string()
    )
    .record(duration.as_secs_f64() * 1000.0);
}

/// Times every request, including the 400s and 404s produced before a handler runs
pub async fn track_request_duration(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or("unmatched", MatchedPath::as_str)
        .to_string();

    let response = next.run(request).await;

    record_http_request(&method, &route, response.status().as_u16(), start.elapsed());
    response
}

pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
