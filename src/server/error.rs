//! API error type.
//!
//! Handlers return `Result<_, ApiError>`; the `IntoResponse` impl turns each
//! variant into a `{"error": "..."}` body with a matching status code.
//! Engine failures that are not the caller's fault are logged in full and
//! reported with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::inference::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The caller referenced a message that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The inference engine refused to start a generation.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(
                EngineError::NoModelLoaded
                | EngineError::BackendNotInitialized
                | EngineError::WorkerError(_),
            ) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::NotFound(m) | ApiError::BadRequest(m) => m.clone(),
            ApiError::Engine(e) if status == StatusCode::SERVICE_UNAVAILABLE => e.to_string(),
            ApiError::Engine(e) => {
                error!(error = %e, "inference engine error");
                "inference backend error".to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
