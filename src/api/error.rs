//! # api::error
//!
//! Every handler returns `Result<_, AppError>`; failures become
//! `{ "ok": false, "error": ".." }` with a status that says whose fault it is.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::error::EngineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The responding stage is stopped or did not answer in time.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The engine answered but refused the command.
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::RequestTimeout(_) | EngineError::NotRunning { .. } => AppError::Unavailable(err.to_string()),
            EngineError::NotFound(what) => AppError::NotFound(what),
            EngineError::Config(e) => AppError::BadRequest(e.to_string()),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::CommandFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Internal error: {err:#}")),
        };

        (status, Json(json!({ "ok": false, "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timeout_maps_to_503() {
        let resp = AppError::from(EngineError::RequestTimeout(Duration::from_millis(5))).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_not_found_maps_to_404() {
        let resp = AppError::from(EngineError::NotFound("strategy 'x'".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
