//! HTTP API gateway for Loomweave.
//!
//! Two request surfaces share one [`BuildOrchestrator`] (and therefore one
//! hook dispatcher), so a build behaves the same whichever way it arrives:
//!
//! - `POST /api/chat/build`, `/api/chat/complete`, `/api/variables/merge`:
//!   the legacy "router" shapes (`chat_file`, flat asset names)
//! - `POST /v1/engine/build`, `/v1/engine/complete`, `/v1/merge`:
//!   [`BuildParams`](loomweave_pipeline::BuildParams) as-is
//!
//! Conversation, tree and plugin routes live under `/v1` as well.
//!
//! Built on Axum.

pub mod conversations;
pub mod engine;
pub mod error;
pub mod legacy;
pub mod plugins;
pub mod providers;
mod sse;

use axum::extract::DefaultBodyLimit;
use axum::{Router, response::Json, routing::get};
use loomweave_assets::FileAssetStore;
use loomweave_config::AppConfig;
use loomweave_hooks::HookDispatcher;
use loomweave_pipeline::{BuildOrchestrator, ProviderSource};
use loomweave_storage::{ConversationService, FileConversationStore, FileVariableStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use providers::ConfiguredProviders;
pub use sse::CANCEL_KEY_HEADER;

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<BuildOrchestrator>,
    pub providers: Arc<dyn ProviderSource>,
    /// Used for HTTP hook plugins
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// File-backed state rooted at `config.storage.data_dir`.
    pub fn from_config(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        let storage = &config.storage;
        let conversations = ConversationService::new(
            Arc::new(FileConversationStore::new(storage.conversations_dir())),
            Arc::new(FileVariableStore::new(storage.variables_dir())),
        );
        let hooks = HookDispatcher::new(Duration::from_millis(config.pipeline.hook_timeout_ms));
        let orchestrator = BuildOrchestrator::new(
            Arc::new(conversations),
            Arc::new(FileAssetStore::new(storage.assets_dir())),
            Arc::new(hooks),
            config.pipeline.clone(),
        );

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            providers: Arc::new(ConfiguredProviders::new(config.llm.clone(), http.clone())),
            http,
        })
    }
}

/// Build the full router: both surfaces plus the shared `/v1` routes.
pub fn build_router(state: SharedState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(legacy::legacy_router())
        .merge(engine::engine_router())
        .merge(conversations::conversation_router())
        .merge(plugins::hooks_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = Arc::new(AppState::from_config(&config)?);
    let app = build_router(state, config.gateway.body_limit);

    info!(
        addr = %addr,
        data_dir = %config.storage.data_dir.display(),
        model = %config.llm.model,
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
