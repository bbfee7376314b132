//! The engine surface: pipeline types straight through.
//!
//! - `POST /v1/engine/build`    `BuildParams` → `BuildResult`
//! - `POST /v1/engine/complete` `BuildParams` → SSE of `CompleteEvent`
//! - `POST /v1/merge`           `MergeRequest` → `MergeResponse`

use axum::{
    Router,
    extract::State,
    response::{Json, Response},
    routing::post,
};
use loomweave_pipeline::{BuildParams, BuildResult};
use loomweave_variables::{MergeRequest, MergeResponse};
use tracing::info;

use crate::SharedState;
use crate::error::ApiResult;
use crate::sse::sse_response;

pub fn engine_router() -> Router<SharedState> {
    Router::new()
        .route("/v1/engine/build", post(build_handler))
        .route("/v1/engine/complete", post(complete_handler))
        .route("/v1/merge", post(merge_handler))
}

async fn build_handler(
    State(state): State<SharedState>,
    Json(params): Json<BuildParams>,
) -> ApiResult<Json<BuildResult>> {
    info!(conversation = ?params.conversation_id, "engine build");
    Ok(Json(state.orchestrator.build(params).await?))
}

async fn complete_handler(
    State(state): State<SharedState>,
    Json(params): Json<BuildParams>,
) -> ApiResult<Response> {
    info!(conversation = ?params.conversation_id, "engine complete");
    let stream = state
        .orchestrator
        .complete(params, state.providers.clone())
        .await?;
    Ok(sse_response(stream))
}

async fn merge_handler(Json(request): Json<MergeRequest>) -> Json<MergeResponse> {
    Json(request.execute())
}
