//! Media catalogue routes.

use axum::{
    Json, Router,
    extract::{Multipart, Query, State},
    routing::{get, post},
};
use bytes::Bytes;

use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{FilesResponse, UploadQuery, UploadResponse};
use crate::api::server::AppState;

/// Create the media router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/files", get(list_files))
        .route("/list-media", get(list_files))
        .route("/upload", post(upload))
}

async fn list_files(State(state): State<AppState>) -> ApiResult<Json<FilesResponse>> {
    let files = state.manager.list_media().await?;
    if files.is_empty() {
        tracing::warn!("No media files found");
    } else {
        tracing::debug!(count = files.len(), "Listed media files");
    }
    Ok(Json(FilesResponse {
        files,
        expiry: state.manager.file_expiry(),
    }))
}

/// Multipart upload with a `file` part and optional `expire_time` minutes,
/// given either as a query parameter or as a form part.
async fn upload(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let mut upload: Option<(String, Bytes)> = None;
    let mut expire_time = query.expire_time;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::bad_request("Uploaded file has no name"))?;
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read upload: {e}")))?;
                upload = Some((name, data));
            }
            Some("expire_time") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid expire_time: {e}")))?;
                if !raw.trim().is_empty() {
                    expire_time = Some(raw.trim().parse().map_err(|_| {
                        ApiError::bad_request(format!("Invalid expire_time '{raw}'"))
                    })?);
                }
            }
            _ => {}
        }
    }

    let (name, data) = upload.ok_or_else(|| ApiError::bad_request("Missing 'file' part"))?;
    let receipt = state.manager.upload(&name, data, expire_time).await?;

    Ok(Json(UploadResponse {
        status: "success",
        filename: receipt.filename,
        expires_at: receipt.expires_at,
    }))
}
