//! Conversation and branch-tree routes, shared by both surfaces.
//!
//! - `GET    /v1/conversations`                    list
//! - `POST   /v1/conversations`                    create
//! - `GET    /v1/conversations/{id}`               full tree
//! - `DELETE /v1/conversations/{id}`
//! - `POST   /v1/conversations/{id}/append`        `{parent_id?, role, content}`
//! - `POST   /v1/conversations/{id}/append_at`     `{node_id, role, content}`
//! - `POST   /v1/conversations/{id}/switch`        `{depth, direction}`
//! - `POST   /v1/conversations/{id}/delete_branch` `{node_id}`
//! - `POST   /v1/conversations/{id}/truncate`      `{depth}`
//! - `POST   /v1/conversations/{id}/retry`         `{user_node_id}`
//! - `POST   /v1/conversations/{id}/select`        `{node_id}`
//! - `PATCH  /v1/conversations/{id}/nodes/{node}`  `{content}`
//! - `GET    /v1/conversations/{id}/branches`      branch table
//! - `POST   /v1/conversations/{id}/cancel`        stop a running completion
//!
//! Tree operations answer with the operation's result and the updated
//! conversation.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
};
use loomweave_core::{BranchIndicator, Direction, RetryOutcome, Role};
use loomweave_storage::{Conversation, ConversationSummary, DeleteOutcome, NewConversation};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::SharedState;
use crate::error::{ApiError, ApiResult};

pub fn conversation_router() -> Router<SharedState> {
    Router::new()
        .route("/v1/conversations", get(list_handler).post(create_handler))
        .route(
            "/v1/conversations/{id}",
            get(get_handler).delete(delete_handler),
        )
        .route("/v1/conversations/{id}/append", post(append_handler))
        .route("/v1/conversations/{id}/append_at", post(append_at_handler))
        .route("/v1/conversations/{id}/switch", post(switch_handler))
        .route(
            "/v1/conversations/{id}/delete_branch",
            post(delete_branch_handler),
        )
        .route("/v1/conversations/{id}/truncate", post(truncate_handler))
        .route("/v1/conversations/{id}/retry", post(retry_handler))
        .route("/v1/conversations/{id}/select", post(select_handler))
        .route(
            "/v1/conversations/{id}/nodes/{node_id}",
            patch(update_node_handler),
        )
        .route("/v1/conversations/{id}/branches", get(branches_handler))
        .route("/v1/conversations/{id}/cancel", post(cancel_handler))
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ConversationListResponse {
    conversations: Vec<ConversationSummary>,
}

#[derive(Serialize)]
struct DeletedResponse {
    deleted: bool,
}

#[derive(Serialize)]
struct TreeOpResponse<T: Serialize> {
    result: T,
    conversation: Conversation,
}

fn tree_op<T: Serialize>((conversation, result): (Conversation, T)) -> Json<TreeOpResponse<T>> {
    Json(TreeOpResponse {
        result,
        conversation,
    })
}

#[derive(Deserialize)]
struct AppendRequest {
    #[serde(default)]
    parent_id: Option<String>,
    role: Role,
    content: String,
}

#[derive(Deserialize)]
struct AppendAtRequest {
    node_id: String,
    role: Role,
    content: String,
}

#[derive(Deserialize)]
struct SwitchRequest {
    depth: usize,
    direction: Direction,
}

#[derive(Deserialize)]
struct NodeRequest {
    node_id: String,
}

#[derive(Deserialize)]
struct DepthRequest {
    depth: usize,
}

#[derive(Deserialize)]
struct RetryRequest {
    user_node_id: String,
}

#[derive(Deserialize)]
struct ContentRequest {
    content: String,
}

#[derive(Serialize)]
struct BranchesResponse {
    branches: Vec<BranchIndicator>,
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn list_handler(State(state): State<SharedState>) -> ApiResult<Json<ConversationListResponse>> {
    let mut conversations = state.orchestrator.conversations().list().await?;
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(ConversationListResponse { conversations }))
}

async fn create_handler(
    State(state): State<SharedState>,
    Json(params): Json<NewConversation>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state.orchestrator.conversations().create(params).await?;
    info!(id = %conversation.id, "Conversation created");
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(state.orchestrator.conversations().get(&id).await?))
}

async fn delete_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeletedResponse>> {
    let deleted = state.orchestrator.conversations().delete(&id).await?;
    if !deleted {
        return Err(ApiError::NotFound(format!("conversation not found: {id}")));
    }
    Ok(Json(DeletedResponse { deleted }))
}

async fn append_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AppendRequest>,
) -> ApiResult<Json<TreeOpResponse<String>>> {
    let out = state
        .orchestrator
        .conversations()
        .append(&id, req.parent_id.as_deref(), req.role, &req.content)
        .await?;
    Ok(tree_op(out))
}

async fn append_at_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<AppendAtRequest>,
) -> ApiResult<Json<TreeOpResponse<String>>> {
    let (conversation, created) = state
        .orchestrator
        .conversations()
        .append_at(&id, &req.node_id, req.role, &req.content)
        .await?;
    let created = created.ok_or_else(|| ApiError::NotFound(format!("node not found: {}", req.node_id)))?;
    Ok(tree_op((conversation, created)))
}

/// `result` is the newly selected node, or `null` when there was nowhere to go.
async fn switch_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SwitchRequest>,
) -> ApiResult<Json<TreeOpResponse<Option<String>>>> {
    let out = state
        .orchestrator
        .conversations()
        .switch_branch(&id, req.depth, req.direction)
        .await?;
    Ok(tree_op(out))
}

async fn delete_branch_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<NodeRequest>,
) -> ApiResult<Json<TreeOpResponse<DeleteOutcome>>> {
    let out = state
        .orchestrator
        .conversations()
        .delete_branch(&id, &req.node_id)
        .await?;
    Ok(tree_op(out))
}

async fn truncate_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<DepthRequest>,
) -> ApiResult<Json<TreeOpResponse<bool>>> {
    let out = state
        .orchestrator
        .conversations()
        .truncate_after(&id, req.depth)
        .await?;
    Ok(tree_op(out))
}

async fn retry_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RetryRequest>,
) -> ApiResult<Json<TreeOpResponse<RetryOutcome>>> {
    let (conversation, outcome) = state
        .orchestrator
        .conversations()
        .retry(&id, &req.user_node_id)
        .await?;
    let outcome = outcome.ok_or_else(|| {
        ApiError::BadRequest(format!("{} is not a user message", req.user_node_id))
    })?;
    Ok(tree_op((conversation, outcome)))
}

async fn select_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<NodeRequest>,
) -> ApiResult<Json<TreeOpResponse<String>>> {
    let (conversation, found) = state
        .orchestrator
        .conversations()
        .select(&id, &req.node_id)
        .await?;
    if !found {
        return Err(ApiError::NotFound(format!("node not found: {}", req.node_id)));
    }
    Ok(tree_op((conversation, req.node_id)))
}

async fn update_node_handler(
    State(state): State<SharedState>,
    Path((id, node_id)): Path<(String, String)>,
    Json(req): Json<ContentRequest>,
) -> ApiResult<Json<TreeOpResponse<String>>> {
    let (conversation, found) = state
        .orchestrator
        .conversations()
        .update_content(&id, &node_id, &req.content)
        .await?;
    if !found {
        return Err(ApiError::NotFound(format!("node not found: {node_id}")));
    }
    Ok(tree_op((conversation, node_id)))
}

async fn branches_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Json<BranchesResponse>> {
    let branches = state.orchestrator.conversations().branches(&id).await?;
    Ok(Json(BranchesResponse { branches }))
}

/// `id` is a conversation id, or the cancel key of an inline completion.
async fn cancel_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.orchestrator.cancels().cancel(&id).await;
    info!(key = %id, cancelled, "Cancel requested");
    Json(CancelResponse { cancelled })
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::http::{Method, StatusCode};
    use serde_json::{Value, json};

    async fn seeded() -> (axum::Router, crate::SharedState) {
        let state = test_state().await;
        let app = app(state.clone());
        let response = send(
            &app,
            Method::POST,
            "/v1/conversations",
            Some(json!({"id": "c1", "title": "North", "system_prompt": "Be brief.", "greeting": "Hello."})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        (app, state)
    }

    fn active_path(body: &Value) -> Vec<String> {
        body["conversation"]["tree"]["active_path"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn create_list_get_delete() {
        let (app, _) = seeded().await;

        let list = body_json(send(&app, Method::GET, "/v1/conversations", None).await).await;
        assert_eq!(list["conversations"][0]["id"], "c1");
        assert_eq!(list["conversations"][0]["title"], "North");

        let got = send(&app, Method::GET, "/v1/conversations/c1", None).await;
        assert_eq!(got.status(), StatusCode::OK);

        let dup = send(&app, Method::POST, "/v1/conversations", Some(json!({"id": "c1"}))).await;
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let deleted = send(&app, Method::DELETE, "/v1/conversations/c1", None).await;
        assert_eq!(deleted.status(), StatusCode::OK);
        let missing = send(&app, Method::GET, "/v1/conversations/c1", None).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let again = send(&app, Method::DELETE, "/v1/conversations/c1", None).await;
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn append_switch_and_branches() {
        let (app, _) = seeded().await;
        let appended = body_json(
            send(
                &app,
                Method::POST,
                "/v1/conversations/c1/append",
                Some(json!({"role": "user", "content": "Hi"})),
            )
            .await,
        )
        .await;
        let user_id = appended["result"].as_str().unwrap().to_string();
        assert_eq!(active_path(&appended).last().unwrap(), &user_id);

        // Depths are 1-indexed; Right on the last sibling creates a fresh alternative
        let switched = body_json(
            send(
                &app,
                Method::POST,
                "/v1/conversations/c1/switch",
                Some(json!({"depth": 3, "direction": "right"})),
            )
            .await,
        )
        .await;
        let fresh = switched["result"].as_str().unwrap().to_string();
        assert_ne!(fresh, user_id);

        let branches = body_json(send(&app, Method::GET, "/v1/conversations/c1/branches", None).await).await;
        let table = branches["branches"].as_array().unwrap();
        assert_eq!(table[2]["count"], 2);
        assert_eq!(table[2]["index"], 2);

        let selected = send(
            &app,
            Method::POST,
            "/v1/conversations/c1/select",
            Some(json!({"node_id": user_id})),
        )
        .await;
        assert_eq!(selected.status(), StatusCode::OK);
        assert_eq!(active_path(&body_json(selected).await).last().unwrap(), &user_id);
    }

    #[tokio::test]
    async fn unknown_parent_is_404() {
        let (app, _) = seeded().await;
        let response = send(
            &app,
            Method::POST,
            "/v1/conversations/c1/append",
            Some(json!({"parent_id": "ghost", "role": "user", "content": "Hi"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            Method::POST,
            "/v1/conversations/c1/select",
            Some(json!({"node_id": "ghost"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_truncate_delete_and_edit() {
        let (app, state) = seeded().await;
        let user = body_json(
            send(
                &app,
                Method::POST,
                "/v1/conversations/c1/append",
                Some(json!({"role": "user", "content": "Hi"})),
            )
            .await,
        )
        .await["result"]
            .as_str()
            .unwrap()
            .to_string();

        let retried = send(
            &app,
            Method::POST,
            "/v1/conversations/c1/retry",
            Some(json!({"user_node_id": user})),
        )
        .await;
        assert_eq!(retried.status(), StatusCode::OK);
        let retried = body_json(retried).await;
        let reply = retried["result"]["node_id"].as_str().unwrap().to_string();

        let edited = send(
            &app,
            Method::PATCH,
            &format!("/v1/conversations/c1/nodes/{reply}"),
            Some(json!({"content": "Edited."})),
        )
        .await;
        assert_eq!(edited.status(), StatusCode::OK);
        let conv = state.orchestrator.conversations().get("c1").await.unwrap();
        assert_eq!(conv.tree.node(&reply).unwrap().content, "Edited.");

        let deleted = body_json(
            send(
                &app,
                Method::POST,
                "/v1/conversations/c1/delete_branch",
                Some(json!({"node_id": user})),
            )
            .await,
        )
        .await;
        assert_eq!(deleted["result"]["deleted"], true);
        let conv = state.orchestrator.conversations().get("c1").await.unwrap();
        assert!(conv.tree.node(&user).is_none());
        assert!(conv.tree.node(&reply).is_none());

        let truncated = body_json(
            send(
                &app,
                Method::POST,
                "/v1/conversations/c1/truncate",
                Some(json!({"depth": 1})),
            )
            .await,
        )
        .await;
        assert_eq!(active_path(&truncated).len(), 1);
    }

    #[tokio::test]
    async fn cancel_without_running_completion() {
        let (app, _) = seeded().await;
        let response = body_json(send(&app, Method::POST, "/v1/conversations/c1/cancel", None).await).await;
        assert_eq!(response["cancelled"], false);
    }
}
