//! API key authentication middleware

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use secrecy::ExposeSecret;

use super::ApiState;

/// Bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Middleware to verify API key
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // If no API key configured, allow all requests (development mode)
    let Some(expected_key) = &state.api_key else {
        tracing::warn!("API key not configured - allowing unauthenticated access");
        return Ok(next.run(req).await);
    };

    match bearer_token(req.headers()) {
        Some(key) if key == expected_key.expose_secret() => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            tracing::debug!("no API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer test-key-123"),
        );
        assert_eq!(bearer_token(&headers), Some("test-key-123"));
    }
}
