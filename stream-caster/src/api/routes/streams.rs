//! Stream lifecycle routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::ApiResult;
use crate::api::models::{
    ActiveStreamsResponse, BandwidthResponse, BranchResponse, StartStreamBody,
    StartStreamResponseBody, StopStreamResponse, StreamStatusResponse,
};
use crate::api::server::AppState;
use crate::caster::{BranchSelector, StreamId};

/// Create the streams router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/start-stream", post(start_stream))
        .route("/stop-stream/{stream_id}", post(stop_stream))
        .route("/stop-branch/{stream_id}/{branch}", post(stop_branch))
        .route("/restart-branch/{stream_id}/{branch}", post(restart_branch))
        .route("/stream-status/{stream_id}", get(stream_status))
        .route("/bandwidth/{stream_id}", get(bandwidth))
        .route("/active-streams", get(active_streams))
}

async fn start_stream(
    State(state): State<AppState>,
    Json(body): Json<StartStreamBody>,
) -> ApiResult<Json<StartStreamResponseBody>> {
    tracing::info!(?body, "Received request to start stream");
    let stream = state.manager.start_stream(body.into_request()).await?;
    Ok(Json(StartStreamResponseBody {
        status: "success",
        stream,
    }))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StopStreamResponse>> {
    let stream_id = StreamId::from(stream_id);
    state.manager.stop_stream(&stream_id).await?;
    Ok(Json(StopStreamResponse {
        status: "stopped",
        stream_id,
    }))
}

async fn stop_branch(
    State(state): State<AppState>,
    Path((stream_id, branch)): Path<(String, String)>,
) -> ApiResult<Json<BranchResponse>> {
    let selector: BranchSelector = branch.parse()?;
    let branch = state
        .manager
        .stop_branch(&StreamId::from(stream_id), selector)
        .await?;
    Ok(Json(BranchResponse {
        status: "branch stopped",
        branch,
    }))
}

async fn restart_branch(
    State(state): State<AppState>,
    Path((stream_id, branch)): Path<(String, String)>,
) -> ApiResult<Json<BranchResponse>> {
    let selector: BranchSelector = branch.parse()?;
    let branch = state
        .manager
        .restart_branch(&StreamId::from(stream_id), selector)
        .await?;
    Ok(Json(BranchResponse {
        status: "branch restarted",
        branch,
    }))
}

async fn stream_status(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<StreamStatusResponse>> {
    let stream_id = StreamId::from(stream_id);
    let status = state.manager.stream_status(&stream_id)?;
    Ok(Json(StreamStatusResponse { stream_id, status }))
}

async fn bandwidth(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> ApiResult<Json<BandwidthResponse>> {
    let stream_id = StreamId::from(stream_id);
    let bandwidth = state.manager.bandwidth(&stream_id)?;
    Ok(Json(BandwidthResponse {
        stream_id,
        bandwidth,
    }))
}

async fn active_streams(State(state): State<AppState>) -> Json<ActiveStreamsResponse> {
    Json(ActiveStreamsResponse {
        active_streams: state.manager.active_streams(),
    })
}
