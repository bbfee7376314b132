//! Build, then stream a model reply and write it back to the tree.
//!
//! The conversation lock is taken before the stream starts and held until
//! the task ends, so a completion and a concurrent edit of the same
//! conversation never interleave. The reply is written to the node chosen
//! at request start; cancellation, a provider error or a client that went
//! away leaves the tree and the variables untouched.

use chrono::Utc;
use loomweave_assets::LlmConfig;
use loomweave_config::LlmSettings;
use loomweave_core::{Provider, ProviderRequest, Role, Usage};
use loomweave_hooks::{HookContext, HookPoint};
use loomweave_storage::{Conversation, ConversationGuard};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::PipelineError;
use crate::cancel::CancelHandle;
use crate::event::{CompleteEvent, ErrorCode};
use crate::orchestrator::{BuildOrchestrator, BuildParams, HistorySource, Prepared};

/// A provider plus the request settings to use with it.
pub struct ResolvedModel {
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Picks the provider for a completion, given the bundle's `llm_config`.
pub trait ProviderSource: Send + Sync {
    fn resolve(&self, overrides: Option<&LlmConfig>) -> Result<ResolvedModel, PipelineError>;
}

/// Overlay a named endpoint config on the configured defaults.
pub fn merge_llm(settings: &LlmSettings, overrides: Option<&LlmConfig>) -> LlmSettings {
    let mut merged = settings.clone();
    if let Some(o) = overrides {
        if let Some(base_url) = &o.base_url {
            merged.base_url = base_url.clone();
        }
        if let Some(model) = &o.model {
            merged.model = model.clone();
        }
        if o.api_key.is_some() {
            merged.api_key = o.api_key.clone();
        }
        if let Some(temperature) = o.temperature {
            merged.temperature = temperature;
        }
        if o.max_tokens.is_some() {
            merged.max_tokens = o.max_tokens;
        }
    }
    merged
}

/// One provider for every request; only model settings can be overridden.
pub struct FixedProvider {
    provider: Arc<dyn Provider>,
    settings: LlmSettings,
}

impl FixedProvider {
    pub fn new(provider: Arc<dyn Provider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }
}

impl ProviderSource for FixedProvider {
    fn resolve(&self, overrides: Option<&LlmConfig>) -> Result<ResolvedModel, PipelineError> {
        let merged = merge_llm(&self.settings, overrides);
        Ok(ResolvedModel {
            provider: self.provider.clone(),
            model: merged.model,
            temperature: merged.temperature,
            max_tokens: merged.max_tokens,
        })
    }
}

/// A running completion.
pub struct CompleteStream {
    /// Cancellation key: the conversation id, or the request id for inline builds
    pub key: String,
    pub events: mpsc::Receiver<CompleteEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkPayload {
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LlmOutput {
    content: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedResponse {
    node_id: String,
    content: String,
}

/// Everything the spawned task owns.
struct Job {
    params: BuildParams,
    ctx: HookContext,
    view: loomweave_core::View,
    conversation: Option<Conversation>,
    target: Option<String>,
    cancel: CancelHandle,
    providers: Arc<dyn ProviderSource>,
    tx: mpsc::Sender<CompleteEvent>,
    _guard: Option<ConversationGuard>,
}

enum Outcome {
    Done,
    /// Cancelled, or the client is gone; nothing persisted
    Aborted,
}

impl BuildOrchestrator {
    /// Validate, lock and pick the target node, then stream in a task.
    ///
    /// Structural problems are returned here; anything after the stream has
    /// started arrives as an `error` event.
    pub async fn complete(
        self: &Arc<Self>,
        params: BuildParams,
        providers: Arc<dyn ProviderSource>,
    ) -> Result<CompleteStream, PipelineError> {
        params.validate()?;
        let view = self.view_for(&params);
        let ctx = HookContext::new(params.conversation_id.clone(), view, params.debug.dry_run);

        let (guard, conversation, target, key) = match params.conversation_id.clone() {
            Some(id) => {
                let guard = self.conversations().locks().lock(&id).await;
                let mut conversation = self.conversations().get(&id).await?;
                let target = resolve_target(&mut conversation, params.target_node_id.as_deref())?;
                (Some(guard), Some(conversation), Some(target), id)
            }
            None => (None, None, None, ctx.request_id.clone()),
        };

        let cancel = self.cancels().register(&key).await;
        let (tx, rx) = mpsc::channel(64);
        let job = Job {
            params,
            ctx,
            view,
            conversation,
            target,
            cancel,
            providers,
            tx,
            _guard: guard,
        };
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(job).await });
        Ok(CompleteStream { key, events: rx })
    }

    /// The token is released before the channel closes, so a client that
    /// has seen the last event can start the next request right away.
    async fn run(&self, mut job: Job) {
        match self.stream_reply(&mut job).await {
            Ok(Outcome::Done) => {}
            Ok(Outcome::Aborted) => {
                info!(key = %job.cancel.key, "Completion aborted; nothing persisted");
                let _ = job
                    .tx
                    .send(CompleteEvent::Error {
                        code: ErrorCode::Cancelled,
                        message: "completion cancelled".into(),
                    })
                    .await;
            }
            Err((code, message)) => {
                warn!(?code, %message, "Completion failed");
                let _ = job.tx.send(CompleteEvent::Error { code, message }).await;
            }
        }
        self.cancels().release(&job.cancel).await;
    }

    async fn stream_reply(&self, job: &mut Job) -> Result<Outcome, (ErrorCode, String)> {
        let pipeline = |e: PipelineError| (ErrorCode::Pipeline, e.to_string());
        let token = job.cancel.token.clone();

        let source = match &job.conversation {
            Some(conversation) => HistorySource::Tree {
                conversation,
                target: job.target.as_deref(),
            },
            None => HistorySource::Inline {
                messages: job.params.messages.as_deref().unwrap_or_default(),
                extra_system: job.params.extra_system.as_deref(),
            },
        };
        let prepared = self
            .prepare(&job.params, source, job.view, &job.ctx)
            .await
            .map_err(pipeline)?;
        if job.params.debug.include_stages
            && !send(&job.tx, CompleteEvent::Stages {
                stages: prepared.stages.clone(),
            })
            .await
        {
            return Ok(Outcome::Aborted);
        }

        let resolved = job
            .providers
            .resolve(prepared.bundle.llm.as_ref())
            .map_err(pipeline)?;
        let request = ProviderRequest {
            model: resolved.model,
            messages: prepared
                .result
                .messages
                .iter()
                .filter(|m| m.role != Role::Thinking)
                .cloned()
                .collect(),
            temperature: resolved.temperature,
            max_tokens: resolved.max_tokens,
            stream: true,
            stop: Vec::new(),
        };
        let request = self
            .hooks()
            .dispatch_typed(HookPoint::LlmCallBefore, request, &job.ctx)
            .await;
        info!(
            provider = resolved.provider.name(),
            model = %request.model,
            messages = request.messages.len(),
            "Calling model"
        );

        let provider_error = |e: loomweave_core::ProviderError| (ErrorCode::Provider, e.to_string());
        let mut upstream = tokio::select! {
            _ = token.cancelled() => return Ok(Outcome::Aborted),
            stream = resolved.provider.stream(request) => stream.map_err(provider_error)?,
        };

        let mut content = String::new();
        let mut finish_reason = None;
        let mut usage = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(Outcome::Aborted),
                _ = job.tx.closed() => return Ok(Outcome::Aborted),
                next = upstream.recv() => next,
            };
            let chunk = match next {
                None => break,
                Some(Err(e)) => return Err(provider_error(e)),
                Some(Ok(chunk)) => chunk,
            };
            if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                let payload = self
                    .hooks()
                    .dispatch_typed(HookPoint::StreamChunkBefore, ChunkPayload { content: text }, &job.ctx)
                    .await;
                content.push_str(&payload.content);
                if !send(&job.tx, CompleteEvent::Chunk {
                    content: payload.content.clone(),
                })
                .await
                {
                    return Ok(Outcome::Aborted);
                }
                self.hooks()
                    .dispatch(
                        HookPoint::StreamChunkAfter,
                        json!({"content": payload.content}),
                        &job.ctx,
                    )
                    .await;
            }
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason;
            }
            if chunk.usage.is_some() {
                usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }
        drop(upstream);

        let output = self
            .hooks()
            .dispatch_typed(
                HookPoint::LlmCallAfter,
                LlmOutput {
                    content,
                    finish_reason,
                    usage,
                },
                &job.ctx,
            )
            .await;
        if token.is_cancelled() {
            return Ok(Outcome::Aborted);
        }

        let node_id = match (&mut job.conversation, &job.target) {
            (Some(conversation), Some(target)) if !job.params.debug.dry_run => {
                self.save_reply(conversation, target, &output.content, &prepared, &job.ctx)
                    .await?;
                Some(target.clone())
            }
            _ => None,
        };

        let events = [
            CompleteEvent::Finish {
                finish_reason: output.finish_reason,
                node_id,
                content: output.content,
            },
            CompleteEvent::Usage {
                usage: output.usage,
            },
            CompleteEvent::Postprocess {
                instructions: job.ctx.instructions(),
            },
            CompleteEvent::End,
        ];
        for event in events {
            // The reply is already saved; a vanished client changes nothing
            if !send(&job.tx, event).await {
                break;
            }
        }
        Ok(Outcome::Done)
    }

    async fn save_reply(
        &self,
        conversation: &mut Conversation,
        target: &str,
        content: &str,
        prepared: &Prepared,
        ctx: &HookContext,
    ) -> Result<(), (ErrorCode, String)> {
        let storage = |e: PipelineError| (ErrorCode::Storage, e.to_string());
        let saved = self
            .hooks()
            .dispatch_typed(
                HookPoint::SaveResponseBefore,
                SavedResponse {
                    node_id: target.to_string(),
                    content: content.to_string(),
                },
                ctx,
            )
            .await;
        // Plugins may rewrite the text but never redirect the write
        conversation.tree.update_content(target, saved.content.clone());
        conversation.updated_at = Utc::now();
        self.conversations()
            .store()
            .save(conversation)
            .await
            .map_err(|e| storage(e.into()))?;
        let globals = self.conversations().lock_globals().await;
        self.persist_variables(&conversation.id, prepared, ctx)
            .await
            .map_err(storage)?;
        drop(globals);
        info!(conversation = %conversation.id, node = target, chars = saved.content.len(), "Reply saved");

        self.hooks()
            .dispatch(
                HookPoint::SaveResponseAfter,
                json!({"node_id": target, "content": saved.content}),
                ctx,
            )
            .await;
        Ok(())
    }
}

/// The node the reply goes to. An explicit target must be an assistant
/// node; otherwise an empty assistant tail is reused or a new one is added
/// (in memory until the reply is saved).
fn resolve_target(conversation: &mut Conversation, requested: Option<&str>) -> Result<String, PipelineError> {
    let tree = &mut conversation.tree;
    if let Some(id) = requested {
        let node = tree
            .node(id)
            .ok_or_else(|| PipelineError::NodeNotFound(id.to_string()))?;
        if node.role != Role::Assistant {
            return Err(PipelineError::InvalidParams(format!(
                "target node {id} is a {} node, not assistant",
                node.role
            )));
        }
        return Ok(id.to_string());
    }
    let tail = tree.active_tail().to_string();
    if let Some(node) = tree.node(&tail) {
        if node.role == Role::Assistant && node.content.is_empty() {
            return Ok(tail);
        }
    }
    tree.append(&tail, Role::Assistant, "")
        .map_err(|e| PipelineError::Storage(e.into()))
}

async fn send(tx: &mpsc::Sender<CompleteEvent>, event: CompleteEvent) -> bool {
    tx.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loomweave_assets::InMemoryAssetStore;
    use loomweave_config::PipelineConfig;
    use loomweave_core::{Message, ProviderError, ProviderResponse, StreamChunk};
    use loomweave_hooks::{HookDispatcher, HookError, HookRegistration, hook_fn};
    use loomweave_storage::{
        ConversationService, InMemoryConversationStore, InMemoryVariableStore, NewConversation,
    };
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    type HookResult = Result<Option<Value>, HookError>;

    /// Streams scripted chunks, optionally failing or stalling after them.
    struct Scripted {
        chunks: Vec<&'static str>,
        fail: bool,
        stall: bool,
        seen: Mutex<Vec<ProviderRequest>>,
    }

    impl Scripted {
        fn new(chunks: Vec<&'static str>) -> Self {
            Self {
                chunks,
                fail: false,
                stall: false,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("stream only".into()))
        }

        async fn stream(
            &self,
            request: ProviderRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            self.seen.lock().unwrap().push(request);
            let (tx, rx) = mpsc::channel(8);
            let chunks = self.chunks.clone();
            let (fail, stall) = (self.fail, self.stall);
            tokio::spawn(async move {
                for text in chunks {
                    let chunk = StreamChunk {
                        content: Some(text.to_string()),
                        ..Default::default()
                    };
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                if fail {
                    let _ = tx
                        .send(Err(ProviderError::StreamInterrupted("connection reset".into())))
                        .await;
                    return;
                }
                if stall {
                    tx.closed().await;
                    return;
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: None,
                        done: true,
                        finish_reason: Some("stop".into()),
                        usage: Some(Usage {
                            prompt_tokens: 10,
                            completion_tokens: 2,
                            total_tokens: 12,
                        }),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    fn orchestrator() -> Arc<BuildOrchestrator> {
        let service = ConversationService::new(
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(InMemoryVariableStore::new()),
        );
        Arc::new(BuildOrchestrator::new(
            Arc::new(service),
            Arc::new(InMemoryAssetStore::new()),
            Arc::new(HookDispatcher::new(Duration::from_secs(1))),
            PipelineConfig::default(),
        ))
    }

    fn source(provider: Arc<Scripted>) -> Arc<dyn ProviderSource> {
        Arc::new(FixedProvider::new(provider, LlmSettings::default()))
    }

    async fn conversation(orch: &BuildOrchestrator) -> String {
        orch.conversations()
            .create(NewConversation {
                id: Some("c1".into()),
                system_prompt: "Be kind.".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        orch.conversations()
            .append("c1", None, Role::User, "Hi there")
            .await
            .unwrap();
        "c1".into()
    }

    fn threaded(id: &str) -> BuildParams {
        BuildParams {
            conversation_id: Some(id.into()),
            ..Default::default()
        }
    }

    async fn collect(mut stream: CompleteStream) -> Vec<CompleteEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.events.recv().await {
            events.push(event);
        }
        events
    }

    fn types(events: &[CompleteEvent]) -> Vec<&'static str> {
        events.iter().map(CompleteEvent::event_type).collect()
    }

    #[tokio::test]
    async fn streams_and_saves_to_new_node() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let provider = Arc::new(Scripted::new(vec!["Hel", "lo!"]));

        let mut params = threaded(&id);
        params.debug.include_stages = true;
        params.variables.local = json!({"met": true});
        let stream = orch.complete(params, source(provider.clone())).await.unwrap();
        assert_eq!(stream.key, id);
        let events = collect(stream).await;

        assert_eq!(
            types(&events),
            ["stages", "chunk", "chunk", "finish", "usage", "postprocess", "end"]
        );
        let CompleteEvent::Finish { node_id, content, finish_reason } = &events[3] else {
            panic!("expected finish");
        };
        assert_eq!(content, "Hello!");
        assert_eq!(finish_reason.as_deref(), Some("stop"));

        let conv = orch.conversations().get(&id).await.unwrap();
        let node_id = node_id.as_deref().unwrap();
        assert_eq!(conv.tree.active_tail(), node_id);
        assert_eq!(conv.tree.node(node_id).unwrap().content, "Hello!");
        assert_eq!(
            orch.conversations().variables().load_local(&id).await.unwrap(),
            json!({"met": true})
        );

        let sent = provider.seen.lock().unwrap();
        let last = sent[0].messages.last().unwrap();
        assert_eq!(last, &Message::user("Hi there"));
        assert!(!orch.cancels().is_active(&id).await);
    }

    #[tokio::test]
    async fn explicit_target_is_overwritten_in_place() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let (conv, target) = orch
            .conversations()
            .append(&id, None, Role::Assistant, "old reply")
            .await
            .unwrap();
        // Move selection to a sibling; the write must still land on `target`
        let user = conv.tree.active_path()[1].clone();
        let (_, sibling) = orch
            .conversations()
            .append(&id, Some(&user), Role::Assistant, "sibling")
            .await
            .unwrap();

        let mut params = threaded(&id);
        params.target_node_id = Some(target.clone());
        let events = collect(
            orch.complete(params, source(Arc::new(Scripted::new(vec!["new reply"]))))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(types(&events).last(), Some(&"end"));

        let conv = orch.conversations().get(&id).await.unwrap();
        assert_eq!(conv.tree.node(&target).unwrap().content, "new reply");
        assert_eq!(conv.tree.active_tail(), sibling);
        assert_eq!(conv.tree.node(&sibling).unwrap().content, "sibling");
    }

    #[tokio::test]
    async fn provider_error_persists_nothing() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let before = orch.conversations().get(&id).await.unwrap().tree.node_count();

        let mut provider = Scripted::new(vec!["partial"]);
        provider.fail = true;
        let mut params = threaded(&id);
        params.variables.local = json!({"x": 1});
        let events = collect(orch.complete(params, source(Arc::new(provider))).await.unwrap()).await;

        assert_eq!(types(&events), ["chunk", "error"]);
        assert!(matches!(
            events[1],
            CompleteEvent::Error {
                code: ErrorCode::Provider,
                ..
            }
        ));
        let after = orch.conversations().get(&id).await.unwrap().tree.node_count();
        assert_eq!(before, after);
        assert_eq!(
            orch.conversations().variables().load_local(&id).await.unwrap(),
            json!({})
        );
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let mut provider = Scripted::new(vec!["thinking..."]);
        provider.stall = true;

        let mut stream = orch
            .complete(threaded(&id), source(Arc::new(provider)))
            .await
            .unwrap();
        let first = stream.events.recv().await.unwrap();
        assert_eq!(first.event_type(), "chunk");
        assert!(orch.cancels().cancel(&id).await);

        let rest = collect(stream).await;
        assert!(matches!(
            rest.as_slice(),
            [CompleteEvent::Error {
                code: ErrorCode::Cancelled,
                ..
            }]
        ));
        let conv = orch.conversations().get(&id).await.unwrap();
        assert_eq!(conv.tree.node_count(), 2);
    }

    #[tokio::test]
    async fn hooks_shape_request_chunks_and_saved_text() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let registration = HookRegistration::new("plugin", 0)
            .on(
                HookPoint::LlmCallBefore,
                hook_fn(|mut data: Value, _ctx| async move {
                    data["model"] = json!("hooked-model");
                    HookResult::Ok(Some(data))
                }),
            )
            .on(
                HookPoint::StreamChunkBefore,
                hook_fn(|data: Value, _ctx| async move {
                    let upper = data["content"].as_str().unwrap_or_default().to_uppercase();
                    HookResult::Ok(Some(json!({"content": upper})))
                }),
            )
            .on(
                HookPoint::SaveResponseBefore,
                hook_fn(|data: Value, ctx: HookContext| async move {
                    ctx.emit("speak", json!({"text": data["content"]}));
                    HookResult::Ok(Some(json!({"node_id": "elsewhere", "content": "[saved]"})))
                }),
            );
        orch.hooks().register(registration).await.unwrap();

        let provider = Arc::new(Scripted::new(vec!["ok"]));
        let events = collect(orch.complete(threaded(&id), source(provider.clone())).await.unwrap()).await;

        assert_eq!(events[0], CompleteEvent::Chunk { content: "OK".into() });
        let CompleteEvent::Finish { node_id, .. } = &events[1] else {
            panic!("expected finish");
        };
        let CompleteEvent::Postprocess { instructions } = &events[3] else {
            panic!("expected postprocess");
        };
        assert_eq!(instructions[0].plugin_id, "plugin");
        assert_eq!(instructions[0].payload, json!({"text": "OK"}));

        let conv = orch.conversations().get(&id).await.unwrap();
        let node = conv.tree.node(node_id.as_deref().unwrap()).unwrap();
        assert_eq!(node.content, "[saved]");
        assert_eq!(provider.seen.lock().unwrap()[0].model, "hooked-model");
    }

    #[tokio::test]
    async fn dry_run_and_inline_completions_write_nothing() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let mut params = threaded(&id);
        params.debug.dry_run = true;
        let events = collect(
            orch.complete(params, source(Arc::new(Scripted::new(vec!["x"]))))
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(&events[1], CompleteEvent::Finish { node_id: None, .. }));
        assert_eq!(orch.conversations().get(&id).await.unwrap().tree.node_count(), 2);

        let inline = BuildParams {
            messages: Some(vec![Message::user("hi")]),
            ..Default::default()
        };
        let stream = orch
            .complete(inline, source(Arc::new(Scripted::new(vec!["y"]))))
            .await
            .unwrap();
        assert_ne!(stream.key, id);
        assert_eq!(types(&collect(stream).await).last(), Some(&"end"));
    }

    #[tokio::test]
    async fn structural_errors_are_returned_before_streaming() {
        let orch = orchestrator();
        let id = conversation(&orch).await;
        let provider = || source(Arc::new(Scripted::new(vec![])));

        let missing = threaded("ghost");
        assert!(matches!(
            orch.complete(missing, provider()).await,
            Err(PipelineError::ConversationNotFound(_))
        ));

        let user = orch.conversations().get(&id).await.unwrap().tree.active_tail().to_string();
        let mut params = threaded(&id);
        params.target_node_id = Some(user);
        assert!(matches!(
            orch.complete(params, provider()).await,
            Err(PipelineError::InvalidParams(_))
        ));
    }

    #[test]
    fn llm_overrides_layer_on_settings() {
        let settings = LlmSettings::default();
        let merged = merge_llm(
            &settings,
            Some(&LlmConfig {
                model: Some("local-7b".into()),
                temperature: Some(0.2),
                ..Default::default()
            }),
        );
        assert_eq!(merged.model, "local-7b");
        assert_eq!(merged.temperature, 0.2);
        assert_eq!(merged.base_url, settings.base_url);
    }
}
