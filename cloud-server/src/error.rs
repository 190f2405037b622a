//! Error handling

use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
    Json,
};
use serde_json::json;
use shield_core::{ApplyError, IngestError, SubmitError, VerifyError};
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    // Patch admission
    #[error(transparent)]
    Rejected(#[from] VerifyError),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Superseded(String),

    // Core availability
    #[error("{0}")]
    Unavailable(String),
    #[error("admission timed out")]
    Timeout,

    // Validation errors
    #[error("{0}")]
    BadRequest(String),

    // Generic errors
    #[error("{0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::Rejected(e) => {
                tracing::warn!("Patch rejected: {}", e);
                (StatusCode::UNAUTHORIZED, e.to_string())
            }
            AppError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            AppError::Superseded(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Verify(e) => AppError::Rejected(e),
            SubmitError::Apply(e @ ApplyError::Malformed(_)) => AppError::Unprocessable(e.to_string()),
            SubmitError::Apply(e @ ApplyError::Superseded { .. }) => AppError::Superseded(e.to_string()),
            SubmitError::Apply(e @ ApplyError::LedgerFailure(_)) => {
                tracing::error!("Ledger failure during admission: {}", e);
                AppError::Unavailable("rule ledger unavailable".to_string())
            }
            SubmitError::ShuttingDown => AppError::Unavailable("shutting down".to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Malformed(e) => AppError::BadRequest(e.to_string()),
            IngestError::ShuttingDown => AppError::Unavailable("shutting down".to_string()),
        }
    }
}
