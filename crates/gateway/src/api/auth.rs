//! API-key authentication middleware.
//!
//! Clients present an opaque key in `X-API-Key`; the server resolves it to a
//! principal configured in `[server.api_keys]`. Key digests are computed once
//! at startup and compared in constant time. With no keys configured the
//! server runs in dev mode and allows unauthenticated access (with a startup
//! warning).

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// The authenticated principal, attached to the request extensions.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    if state.api_keys.is_empty() {
        return next.run(req).await;
    }

    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let provided_digest = Sha256::digest(provided.as_bytes());

    // Scan every entry with a constant-time comparison so neither key length
    // nor match position leaks.
    let mut principal: Option<&str> = None;
    for (digest, name) in state.api_keys.iter() {
        if bool::from(provided_digest.ct_eq(digest.as_slice())) {
            principal = Some(name);
        }
    }

    match principal {
        Some(name) => {
            req.extensions_mut().insert(Principal(name.to_string()));
            next.run(req).await
        }
        None => (
            axum::http::StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": { "kind": "auth_denied", "message": "invalid or missing API key" }
            })),
        )
            .into_response(),
    }
}
