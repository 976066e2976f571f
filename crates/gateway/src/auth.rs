//! Bearer-token authentication for the protected routes.
//!
//! The token itself is never held in memory: at startup the server reads
//! the env var named by `config.server.api_token_env` and keeps only its
//! SHA-256 digest in `AppState`. Requests are checked by digesting whatever
//! the caller sent and comparing digests in constant time. When no token is
//! configured the middleware waves everything through (dev mode) after a
//! single startup warning.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Resolve the expected token digest at startup. `None` (dev mode) when
/// the env var is unset or empty.
pub fn token_hash_from_env(var: &str) -> Option<Vec<u8>> {
    match std::env::var(var) {
        Ok(token) if !token.is_empty() => Some(Sha256::digest(token.as_bytes()).to_vec()),
        _ => {
            tracing::warn!(var, "no API token configured, running unauthenticated");
            None
        }
    }
}

/// The bearer credential from the `Authorization` header, or `""` when the
/// header is missing or malformed — an empty string digests to a value that
/// cannot match any configured token.
fn bearer_token(req: &Request<Body>) -> &str {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .unwrap_or("")
}

/// Middleware guarding the protected routes. Attach via
/// `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token_hash.as_deref() else {
        // Dev mode.
        return next.run(req).await;
    };

    // Both sides of the comparison are fixed-length digests, so neither the
    // timing nor the length of the caller's input leaks anything.
    let provided = Sha256::digest(bearer_token(&req).as_bytes());
    if bool::from(provided.ct_eq(expected)) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response()
    }
}
