//! Request logging with method, path, status and latency.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    // Health and metrics are scraped constantly; keep them out of the log.
    if path == "/health" || path == "/metrics" {
        return next.run(request).await;
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status().as_u16();

    metrics::increment_counter!("http_requests", "status" => status.to_string());
    if status >= 500 {
        warn!(method = %method, path = %path, status, latency_ms, "request failed");
    } else {
        info!(method = %method, path = %path, status, latency_ms, "request completed");
    }

    response
}
