//! Pre-shared API key authentication.
//!
//! Every `/api/*` route except `/api/health` and the WebSocket upgrades
//! requires `Authorization: Bearer <key>`. Browsers cannot set headers on a
//! WebSocket upgrade, so those routes check a `?token=` query parameter with
//! [`token_matches`] instead.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Extension carrying the expected API key, layered onto the router so
/// [`require_api_key`] does not need the application state.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn reject(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}

/// Axum middleware rejecting requests without a valid bearer key.
///
/// - `401` when the header is missing or not a bearer token
/// - `403` when the key does not match
/// - `500` when the [`ApiKey`] extension is missing
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
            "INTERNAL_ERROR",
        );
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        None => reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
            "UNAUTHORIZED",
        ),
        Some(key) if !constant_time_eq(expected.as_bytes(), key.as_bytes()) => {
            reject(StatusCode::FORBIDDEN, "Invalid API key", "FORBIDDEN")
        }
        Some(_) => next.run(request).await,
    }
}

/// Check a WebSocket `?token=` value against the API key.
pub fn token_matches(expected: &str, token: Option<&str>) -> bool {
    token.is_some_and(|t| constant_time_eq(expected.as_bytes(), t.as_bytes()))
}

/// Constant-time byte comparison.
///
/// Always walks the full length of `expected` so response time does not leak
/// how much of the key matched or how long it is.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("k", Some("k")));
        assert!(!token_matches("k", Some("x")));
        assert!(!token_matches("k", None));
    }
}
