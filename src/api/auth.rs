//! # api::auth — API Key Middleware
//!
//! - no `API_KEY` configured → every request passes (dev mode)
//! - `API_KEY` set → `X-API-Key: <key>` required, except on `/api/health`
//!
//! ```bash
//! curl -H "X-API-Key: $API_KEY" http://localhost:3000/api/automation
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::api::SharedApiState;

pub const API_KEY_HEADER: &str = "X-API-Key";

const OPEN_PATHS: [&str; 1] = ["/api/health"];

pub async fn require_api_key(State(state): State<SharedApiState>, request: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let path = request.uri().path();
    if OPEN_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == expected {
        next.run(request).await
    } else {
        warn!(path, "❌ Unauthorized request — invalid or missing X-API-Key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": "Unauthorized: invalid or missing X-API-Key header",
            })),
        )
            .into_response()
    }
}
