//! Authentication middleware for the REST surface.
//!
//! Tokens arrive as `Authorization: Bearer ...` or, for WebSocket
//! upgrades, as a `token` query parameter. Validated claims are stashed
//! in request extensions for handlers and the role gate.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{jwt::JwtHandler, models::Claims, models::UserRole, RevocationRegistry};

#[derive(Clone)]
pub struct AuthLayerState {
    pub jwt: Arc<JwtHandler>,
    pub revocations: Arc<RevocationRegistry>,
}

pub async fn auth_middleware(
    State(state): State<AuthLayerState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    // Query parameter first (WebSocket upgrades cannot set headers).
    let token_from_query = req.uri().query().and_then(|query| {
        query
            .split('&')
            .find(|pair| pair.starts_with("token="))
            .and_then(|pair| pair.split('=').nth(1))
            .map(|t| t.to_string())
    });

    let token_from_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t.to_string());

    // WebSocket clients may also carry the token as a subprotocol.
    let token_from_subprotocol = req
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|t| t.trim().to_string());

    let token = token_from_query
        .or(token_from_header)
        .or(token_from_subprotocol)
        .ok_or(AuthError::MissingToken)?;

    let claims = state
        .jwt
        .validate_token(&token)
        .map_err(|_| AuthError::InvalidToken)?;

    let hash = crate::auth::token_hash(&token);
    if state.revocations.is_revoked(&hash) {
        return Err(AuthError::Revoked);
    }

    req.extensions_mut().insert(claims);
    req.extensions_mut().insert(VerifiedTokenHash(hash));
    Ok(next.run(req).await)
}

/// Token hash established at authentication, available to handlers.
#[derive(Clone)]
pub struct VerifiedTokenHash(pub String);

/// Role gate for admin endpoints; runs after `auth_middleware`.
pub async fn require_admin(req: Request, next: Next) -> Result<Response, AuthError> {
    match req.extensions().get::<Claims>() {
        Some(claims) if claims.role == UserRole::Admin => Ok(next.run(req).await),
        Some(_) => Err(AuthError::Forbidden),
        None => Err(AuthError::MissingToken),
    }
}

#[derive(Debug)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    Revoked,
    Forbidden,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization token"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::Revoked => (StatusCode::UNAUTHORIZED, "Token revoked"),
            AuthError::Forbidden => (StatusCode::FORBIDDEN, "Insufficient role"),
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(
            AuthError::MissingToken.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Revoked.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}
