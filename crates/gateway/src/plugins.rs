//! Hook plugin registration over HTTP.
//!
//! - `GET    /v1/hooks`       registered strategies
//! - `POST   /v1/hooks`       register an HTTP plugin (`?replace=true` to overwrite)
//! - `DELETE /v1/hooks/{id}`  unregister

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
};
use loomweave_hooks::{HttpHookRegistration, StrategyInfo};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SharedState;
use crate::error::{ApiError, ApiResult};

pub fn hooks_router() -> Router<SharedState> {
    Router::new()
        .route("/v1/hooks", get(list_handler).post(register_handler))
        .route("/v1/hooks/{id}", delete(unregister_handler))
}

#[derive(Serialize)]
struct StrategyListResponse {
    strategies: Vec<StrategyInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct RegisterQuery {
    #[serde(default)]
    replace: bool,
}

#[derive(Serialize)]
struct RegisterResponse {
    strategy_id: String,
    replaced: bool,
}

#[derive(Serialize)]
struct UnregisterResponse {
    removed: bool,
}

async fn list_handler(State(state): State<SharedState>) -> Json<StrategyListResponse> {
    Json(StrategyListResponse {
        strategies: state.orchestrator.hooks().list().await,
    })
}

async fn register_handler(
    State(state): State<SharedState>,
    Query(query): Query<RegisterQuery>,
    Json(req): Json<HttpHookRegistration>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    if req.points.is_empty() {
        return Err(ApiError::BadRequest("points must not be empty".into()));
    }
    if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
        return Err(ApiError::BadRequest(format!("unsupported plugin url: {}", req.url)));
    }

    let strategy_id = req.strategy_id.clone();
    info!(strategy = %strategy_id, url = %req.url, points = req.points.len(), "Registering HTTP plugin");
    let registration = req.into_registration(state.http.clone());
    let hooks = state.orchestrator.hooks();
    let replaced = if query.replace {
        hooks.register_or_replace(registration).await
    } else {
        hooks.register(registration).await?;
        false
    };

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            strategy_id,
            replaced,
        }),
    ))
}

async fn unregister_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<UnregisterResponse>> {
    if !state.orchestrator.hooks().unregister(&id).await {
        return Err(ApiError::NotFound(format!("strategy not registered: {id}")));
    }
    Ok(Json(UnregisterResponse { removed: true }))
}
