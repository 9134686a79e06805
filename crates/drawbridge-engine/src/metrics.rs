//! Prometheus metrics recording and endpoint.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Record an HTTP request with its duration.
pub fn record_request(route: &str, method: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("route", route.to_string()),
        ("method", method.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a viewer subscribing to the event stream.
pub fn record_subscriber_connect() {
    metrics::gauge!("ws_subscribers_active").increment(1.0);
}

/// Record a viewer going away.
pub fn record_subscriber_disconnect() {
    metrics::gauge!("ws_subscribers_active").decrement(1.0);
}

/// Record a store mutation and the resulting element count.
pub fn record_mutation(event: &'static str, element_count: usize) {
    metrics::counter!("canvas_mutations_total", "event" => event).increment(1);
    metrics::gauge!("canvas_elements").set(element_count as f64);
}

/// Middleware timing every routed request.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    record_request(
        &route,
        &method,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
