//! Error responses shared by every route.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use loomweave_assets::AssetError;
use loomweave_core::TreeError;
use loomweave_hooks::HookError;
use loomweave_pipeline::PipelineError;
use loomweave_storage::StorageError;
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Hook(#[from] HookError),
}

pub type ApiResult<T> = Result<T, ApiError>;

fn storage_status(err: &StorageError) -> StatusCode {
    match err {
        StorageError::NotFound(_) | StorageError::Tree(TreeError::UnknownNode(_)) => {
            StatusCode::NOT_FOUND
        }
        StorageError::InvalidId(_) => StatusCode::BAD_REQUEST,
        StorageError::AlreadyExists(_) => StatusCode::CONFLICT,
        StorageError::Tree(TreeError::Corrupt(_))
        | StorageError::Corrupt { .. }
        | StorageError::Io(_)
        | StorageError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn asset_status(err: &AssetError) -> StatusCode {
    match err {
        AssetError::NotFound { .. } => StatusCode::NOT_FOUND,
        AssetError::InvalidName(_) | AssetError::Invalid { .. } => StatusCode::BAD_REQUEST,
        AssetError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Pipeline(e) => match e {
                PipelineError::InvalidParams(_) => StatusCode::BAD_REQUEST,
                PipelineError::ConversationNotFound(_) | PipelineError::NodeNotFound(_) => {
                    StatusCode::NOT_FOUND
                }
                PipelineError::Asset(e) => asset_status(e),
                PipelineError::Storage(e) => storage_status(e),
                PipelineError::Provider(_) => StatusCode::BAD_GATEWAY,
            },
            ApiError::Storage(e) => storage_status(e),
            ApiError::Hook(HookError::Duplicate(_)) => StatusCode::CONFLICT,
            ApiError::Hook(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
