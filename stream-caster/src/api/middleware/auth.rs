//! API authentication middleware.
//!
//! Protected routes require a key issued by `/login` in the `x-api-key` header.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Middleware function for API key authentication.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match api_key {
        Some(key) if state.api_keys.is_valid(key, Utc::now()) => Ok(next.run(request).await),
        Some(_) => {
            tracing::warn!("Invalid or expired API key provided");
            Err(ApiError::forbidden("Invalid or expired API Key"))
        }
        None => {
            tracing::warn!("Missing API key in request");
            Err(ApiError::forbidden("Missing API Key"))
        }
    }
}
