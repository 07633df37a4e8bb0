//! HTTP mapping of [`crate::Error`].
//!
//! Every failure leaves the API as `{"code": ..., "detail": ...}` with a
//! status derived from the error kind.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::Error;

/// JSON body of an error response.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: &'static str,
    pub detail: String,
}

/// Error returned by route handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }

    /// Login with missing or wrong credentials.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "INVALID_CREDENTIALS", message)
    }

    /// Protected route without a valid API key.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "INVALID_API_KEY", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            detail: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::AdmissionRejected { max } => {
                tracing::warn!(max, "Rejected start request at capacity");
                ApiError::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "MAX_STREAMS_REACHED",
                    "Max streams reached",
                )
            }
            Error::NotFound { entity_type, id } => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{entity_type} '{id}' not found"),
            ),
            Error::Validation(msg) => ApiError::bad_request(msg),
            Error::InvalidStateTransition { from, to } => ApiError::new(
                StatusCode::CONFLICT,
                "INVALID_STATE",
                format!("Stream cannot move from {from} to {to}"),
            ),
            Error::AcquisitionFailed(msg) => {
                tracing::error!("Source acquisition failed: {}", msg);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ACQUISITION_FAILED", msg)
            }
            Error::ProcessFailure(msg) => {
                tracing::error!("Process failure: {}", msg);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "PROCESS_FAILURE", msg)
            }
            Error::Storage(msg) => {
                tracing::error!("Storage error: {}", msg);
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", msg)
            }
            other => {
                tracing::error!("Unexpected error: {}", other);
                ApiError::internal("An unexpected error occurred")
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
