//! Transport security policy.
//!
//! Outside development, plain-HTTP requests (except health and metrics,
//! which load balancers probe directly) are redirected to HTTPS with a
//! 301, and CORS is a closed allowlist of https origins with a closed
//! method list. Development keeps a permissive layer for local UIs.

use axum::{
    body::Body,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

use crate::config::Environment;

const EXEMPT_PATHS: &[&str] = &["/health", "/metrics"];

/// 301 redirect for plain-HTTP requests in non-development environments.
/// TLS usually terminates at the edge, so the signal is the forwarded
/// proto header rather than the local scheme.
pub async fn https_redirect(request: Request<Body>, next: Next) -> Response {
    if crate::config::environment().is_development() {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let forwarded_proto = request
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok());
    let is_https = match forwarded_proto {
        Some(proto) => proto.eq_ignore_ascii_case("https"),
        None => request.uri().scheme_str() == Some("https"),
    };
    if is_https {
        return next.run(request).await;
    }

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let location = format!(
        "https://{}{}",
        host,
        request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    );
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, location)],
    )
        .into_response()
}

/// CORS policy by environment. Production refuses wildcard anything and
/// drops non-https origins from the configured list.
pub fn build_cors_layer(environment: Environment, allow_origins: &[String]) -> CorsLayer {
    if environment.is_development() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = allow_origins
        .iter()
        .filter(|origin| {
            let ok = origin.starts_with("https://");
            if !ok {
                warn!(origin = %origin, "dropping non-https origin from allowlist");
            }
            ok
        })
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}
