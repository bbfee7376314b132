//! The legacy "router" surface.
//!
//! Older clients name the conversation by its chat file and pass asset
//! names as flat fields. Requests are mapped into [`BuildParams`] and
//! results out of [`BuildResult`]; everything in between is the same
//! orchestrator the engine surface uses.
//!
//! - `POST /api/chat/build`
//! - `POST /api/chat/complete`     SSE
//! - `POST /api/variables/merge`

use axum::{
    Router,
    extract::State,
    response::{Json, Response},
    routing::post,
};
use loomweave_assets::{AssetRefs, RegexRule};
use loomweave_core::{Message, View};
use loomweave_hooks::HookTraceEntry;
use loomweave_pipeline::{
    ActivatedEntry, BuildParams, BuildResult, DebugOptions, OutputMode, PerItemTrace, StageSet,
};
use loomweave_variables::{
    ArrayStrategy, MergeOperation, MergeOptions, MergeRequest, VariableSeed, VariableState,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::SharedState;
use crate::error::ApiResult;
use crate::sse::sse_response;

pub fn legacy_router() -> Router<SharedState> {
    Router::new()
        .route("/api/chat/build", post(build_handler))
        .route("/api/chat/complete", post(complete_handler))
        .route("/api/variables/merge", post(merge_handler))
}

// ── Request / response shapes ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LegacyChatRequest {
    /// Conversation file name; a trailing `.json` is ignored
    pub chat_file: Option<String>,
    pub messages: Option<Vec<Message>>,
    #[serde(alias = "system")]
    pub extra_system: Option<String>,

    pub character: Option<String>,
    pub persona: Option<String>,
    pub preset: Option<String>,
    #[serde(alias = "worldbook")]
    pub worldbooks: Vec<String>,
    #[serde(alias = "regex_sets")]
    pub regex: Vec<String>,
    pub llm_config: Option<String>,

    pub view: Option<View>,
    pub output: OutputMode,
    #[serde(alias = "target")]
    pub target_node_id: Option<String>,

    /// Seeds the conversation-local variables
    pub variables: Value,
    pub global_variables: Value,
    pub variable_mode: MergeOperation,

    pub debug: LegacyDebug,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LegacyDebug {
    pub stages: bool,
    pub per_item: bool,
    pub hook_trace: bool,
    pub dry_run: bool,
}

impl From<LegacyChatRequest> for BuildParams {
    fn from(req: LegacyChatRequest) -> Self {
        BuildParams {
            conversation_id: req
                .chat_file
                .map(|f| f.strip_suffix(".json").unwrap_or(&f).to_string()),
            messages: req.messages,
            extra_system: req.extra_system,
            assets: AssetRefs {
                character: req.character,
                persona: req.persona,
                preset: req.preset,
                worldbooks: req.worldbooks,
                regex: req.regex,
                llm_config: req.llm_config,
            },
            view: req.view,
            output: req.output,
            target_node_id: req.target_node_id,
            variables: VariableSeed {
                local: req.variables,
                global: req.global_variables,
                operation: req.variable_mode,
                options: MergeOptions::default(),
            },
            debug: DebugOptions {
                include_stages: req.debug.stages,
                include_per_item: req.debug.per_item,
                include_hook_trace: req.debug.hook_trace,
                dry_run: req.debug.dry_run,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LegacyBuildResponse {
    pub ok: bool,
    pub messages: Vec<Message>,
    pub variables: VariableState,
    pub activated_entries: Vec<ActivatedEntry>,
    pub applied_regex: Vec<RegexRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<StageSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_item: Option<Vec<PerItemTrace>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook_trace: Option<Vec<HookTraceEntry>>,
}

impl From<BuildResult> for LegacyBuildResponse {
    fn from(result: BuildResult) -> Self {
        LegacyBuildResponse {
            ok: true,
            messages: result.messages,
            variables: result.variables,
            activated_entries: result.active_worldbook_entries,
            applied_regex: result.merged_regex,
            target: result.target_node_id,
            stages: result.stages,
            per_item: result.per_item,
            hook_trace: result.hook_trace,
        }
    }
}

/// Flat merge request: `{base, patch, mode, array_strategy, ...}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LegacyMergeRequest {
    #[serde(alias = "target")]
    pub base: Value,
    #[serde(alias = "source")]
    pub patch: Value,
    pub mode: MergeOperation,
    pub array_strategy: ArrayStrategy,
    pub array_key: Option<String>,
    pub remove_paths: Vec<String>,
}

impl From<LegacyMergeRequest> for MergeRequest {
    fn from(req: LegacyMergeRequest) -> Self {
        MergeRequest {
            base: req.base,
            overrides: req.patch,
            operation: req.mode,
            options: MergeOptions {
                array_strategy: req.array_strategy,
                array_key: req.array_key,
                remove_paths: req.remove_paths,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LegacyMergeResponse {
    pub ok: bool,
    pub result: Value,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn build_handler(
    State(state): State<SharedState>,
    Json(request): Json<LegacyChatRequest>,
) -> ApiResult<Json<LegacyBuildResponse>> {
    info!(chat_file = ?request.chat_file, "legacy build");
    let result = state.orchestrator.build(request.into()).await?;
    Ok(Json(result.into()))
}

async fn complete_handler(
    State(state): State<SharedState>,
    Json(request): Json<LegacyChatRequest>,
) -> ApiResult<Response> {
    info!(chat_file = ?request.chat_file, "legacy complete");
    let stream = state
        .orchestrator
        .complete(request.into(), state.providers.clone())
        .await?;
    Ok(sse_response(stream))
}

async fn merge_handler(Json(request): Json<LegacyMergeRequest>) -> Json<LegacyMergeResponse> {
    let response = MergeRequest::from(request).execute();
    Json(LegacyMergeResponse {
        ok: true,
        result: response.result,
    })
}
