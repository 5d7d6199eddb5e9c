//! Error kinds surfaced across component boundaries.
//!
//! Internal code refines these freely; the API layer translates them to HTTP
//! status codes and jobs use them to decide between retry and permanent
//! failure.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider transient: {0}")]
    ProviderTransient(String),

    #[error("unrecognized statement format: {0}")]
    UnrecognizedFormat(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Jobs retry transient and availability failures; everything else is fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ProviderTransient(_) | AppError::ProviderUnavailable(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::ProviderUnavailable(_) => "provider_unavailable",
            AppError::ProviderTransient(_) => "provider_transient",
            AppError::UnrecognizedFormat(_) => "unrecognized_format",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            // Unique-index violations surface as conflicts so callers re-fetch
            // and retry rather than treating them as crashes.
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::Conflict(e.to_string())
            }
            rusqlite::Error::QueryReturnedNoRows => AppError::NotFound("row".to_string()),
            _ => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Internal(anyhow::Error::new(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                json!({"error": "validation", "message": msg}),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                json!({"error": "not_found", "message": msg}),
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                json!({"error": "conflict", "message": msg}),
            ),
            AppError::ProviderUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "provider_unavailable", "message": msg}),
            ),
            AppError::ProviderTransient(msg) => (
                StatusCode::BAD_GATEWAY,
                json!({"error": "provider_transient", "message": msg}),
            ),
            AppError::UnrecognizedFormat(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({"error": "unrecognized_format", "message": msg}),
            ),
            AppError::Internal(e) => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(%correlation_id, error = ?e, "Unhandled internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "internal", "correlation_id": correlation_id}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
