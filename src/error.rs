//! Control-plane error taxonomy.
//!
//! The data plane never surfaces these per-message; it drops, counts and
//! continues. Control-plane callers (REST, orders, reconciler) branch on
//! the variant to decide retry / failover / abort.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream permanent error: {0}")]
    UpstreamPermanent(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_)
                | GatewayError::UpstreamTransient(_)
                | GatewayError::Store(_)
        )
    }

    /// Whether the failure should feed the per-dependency circuit breaker.
    /// Validation and auth failures say nothing about dependency health.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_) | GatewayError::UpstreamTransient(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamTransient(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamPermanent(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable tag used in JSON error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::RateLimited(_) => "rate_limit_error",
            GatewayError::UpstreamTransient(_) => "upstream_transient_error",
            GatewayError::UpstreamPermanent(_) => "upstream_permanent_error",
            GatewayError::Store(_) => "store_error",
            GatewayError::Config(_) => "config_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Classify an upstream broker REST failure by HTTP status.
    pub fn from_upstream_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => GatewayError::RateLimited(body),
            401 | 403 => GatewayError::Auth(body),
            400 | 422 => GatewayError::Validation(body),
            500..=599 => GatewayError::UpstreamTransient(format!("{status}: {body}")),
            _ => GatewayError::UpstreamPermanent(format!("{status}: {body}")),
        }
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            GatewayError::UpstreamTransient(e.to_string())
        } else if let Some(status) = e.status() {
            GatewayError::from_upstream_status(status.as_u16(), e.to_string())
        } else {
            GatewayError::UpstreamTransient(e.to_string())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let verbose = crate::config::environment().is_development();
        let status = self.status_code();
        let message = if verbose || status.as_u16() < 500 {
            self.to_string()
        } else {
            "internal server error".to_string()
        };
        let body = json!({
            "type": self.kind(),
            "message": message,
            "request_id": uuid::Uuid::new_v4().to_string(),
        });
        (status, Json(body)).into_response()
    }
}
