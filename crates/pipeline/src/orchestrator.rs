//! The build orchestrator: one pipeline behind every API surface.

use loomweave_assets::{AssetBundle, AssetNormalizer, AssetRefs, AssetStore, RegexPlacement, RegexRule};
use loomweave_config::PipelineConfig;
use loomweave_core::{Message, Role, View};
use loomweave_hooks::{HookContext, HookDispatcher, HookPoint, HookTraceEntry};
use loomweave_storage::{Conversation, ConversationService};
use loomweave_variables::{MergeOptions, VariableSeed, VariableState, apply, rebase};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use crate::PipelineError;
use crate::assembler::{AssemblyInput, HistoryItem, assemble_raw};
use crate::cancel::CancelRegistry;
use crate::macros::{MacroContext, MacroProcessor};
use crate::regex_stage::RegexEngine;
use crate::stage::{PerItemTrace, SourcedContent, StageSet};
use crate::worldbook::{ActivatedEntry, ScanItem, SkippedEntry, activate};

// ── Types ──────────────────────────────────────────────────────────────

/// Which items of the final stage become `messages`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Everything
    #[default]
    Full,
    /// Chat history items only
    History,
    /// Items from the newest history message only
    Delta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub include_stages: bool,
    pub include_per_item: bool,
    pub include_hook_trace: bool,
    /// Compute everything, persist nothing
    pub dry_run: bool,
}

/// Input to a build. Exactly one of `conversation_id` and `messages` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildParams {
    /// Tree-backed ("threaded") mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Inline ("sandbox") mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    /// Instruction placed ahead of inline messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_system: Option<String>,
    pub assets: AssetRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view: Option<View>,
    pub output: OutputMode,
    /// The node a model reply would be written to; history stops above it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
    pub variables: VariableSeed,
    pub debug: DebugOptions,
}

impl BuildParams {
    pub fn validate(&self) -> Result<(), PipelineError> {
        match (&self.conversation_id, &self.messages) {
            (Some(_), Some(_)) => Err(PipelineError::InvalidParams(
                "conversation_id and messages are mutually exclusive".into(),
            )),
            (None, None) => Err(PipelineError::InvalidParams(
                "either conversation_id or messages is required".into(),
            )),
            (Some(_), None) if self.extra_system.is_some() => Err(PipelineError::InvalidParams(
                "extra_system only applies to inline messages".into(),
            )),
            (None, Some(_)) if self.target_node_id.is_some() => Err(PipelineError::InvalidParams(
                "target_node_id requires conversation_id".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
    pub messages: Vec<Message>,
    pub variables: VariableState,
    pub active_worldbook_entries: Vec<ActivatedEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_worldbook_entries: Vec<SkippedEntry>,
    /// Deduplicated rules that changed at least one item
    pub merged_regex: Vec<RegexRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stages: Option<StageSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_item: Option<Vec<PerItemTrace>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook_trace: Option<Vec<HookTraceEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node_id: Option<String>,
}

/// Where history comes from.
pub(crate) enum HistorySource<'a> {
    Tree {
        conversation: &'a Conversation,
        /// History stops right above this node
        target: Option<&'a str>,
    },
    Inline {
        messages: &'a [Message],
        extra_system: Option<&'a str>,
    },
}

pub(crate) struct Prepared {
    pub result: BuildResult,
    pub stages: StageSet,
    pub bundle: AssetBundle,
    /// Global variables as read before the build touched them
    pub loaded_global: Value,
}

// ── Orchestrator ───────────────────────────────────────────────────────

pub struct BuildOrchestrator {
    conversations: Arc<ConversationService>,
    normalizer: AssetNormalizer,
    hooks: Arc<HookDispatcher>,
    settings: PipelineConfig,
    cancels: CancelRegistry,
}

impl BuildOrchestrator {
    pub fn new(
        conversations: Arc<ConversationService>,
        assets: Arc<dyn AssetStore>,
        hooks: Arc<HookDispatcher>,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            conversations,
            normalizer: AssetNormalizer::new(assets),
            hooks,
            settings,
            cancels: CancelRegistry::new(),
        }
    }

    pub fn conversations(&self) -> &Arc<ConversationService> {
        &self.conversations
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    pub fn settings(&self) -> &PipelineConfig {
        &self.settings
    }

    pub(crate) fn view_for(&self, params: &BuildParams) -> View {
        params
            .view
            .unwrap_or_else(|| self.settings.default_view.parse().unwrap_or_default())
    }

    /// Run the four stages and persist variables (unless `dry_run` or inline).
    pub async fn build(&self, params: BuildParams) -> Result<BuildResult, PipelineError> {
        params.validate()?;
        let view = self.view_for(&params);
        let ctx = HookContext::new(params.conversation_id.clone(), view, params.debug.dry_run);

        let mut result = match (&params.conversation_id, &params.messages) {
            (Some(id), _) => {
                let _guard = self.conversations.locks().lock(id).await;
                // Held from load to save so concurrent builds never
                // overwrite each other's global writes
                let _globals = if params.debug.dry_run {
                    None
                } else {
                    Some(self.conversations.lock_globals().await)
                };
                let conversation = self.conversations.get(id).await?;
                if let Some(target) = params.target_node_id.as_deref() {
                    if !conversation.tree.contains(target) {
                        return Err(PipelineError::NodeNotFound(target.to_string()));
                    }
                }
                let source = HistorySource::Tree {
                    conversation: &conversation,
                    target: params.target_node_id.as_deref(),
                };
                let prepared = self.prepare(&params, source, view, &ctx).await?;
                if !params.debug.dry_run {
                    self.persist_variables(id, &prepared, &ctx).await?;
                }
                prepared.result
            }
            (None, messages) => {
                let source = HistorySource::Inline {
                    messages: messages.as_deref().unwrap_or_default(),
                    extra_system: params.extra_system.as_deref(),
                };
                self.prepare(&params, source, view, &ctx).await?.result
            }
        };

        if params.debug.include_hook_trace {
            result.hook_trace = Some(ctx.trace());
        }
        info!(
            conversation = params.conversation_id.as_deref().unwrap_or("-"),
            view = view.as_str(),
            messages = result.messages.len(),
            worldbook = result.active_worldbook_entries.len(),
            "Build complete"
        );
        Ok(result)
    }

    /// Everything except persistence.
    pub(crate) async fn prepare(
        &self,
        params: &BuildParams,
        source: HistorySource<'_>,
        view: View,
        ctx: &HookContext,
    ) -> Result<Prepared, PipelineError> {
        let mut variables = self.load_variables(&source).await?;
        let loaded_global = variables.global.clone();
        variables.apply_seed(&params.variables);

        let refs = self
            .hooks
            .dispatch_typed(HookPoint::AssetNormalizeBefore, params.assets.clone(), ctx)
            .await;
        let bundle = self.normalizer.normalize(&refs).await?;
        let bundle = self
            .hooks
            .dispatch_typed(HookPoint::AssetNormalizeAfter, bundle, ctx)
            .await;

        let (history, extra_system) = match &source {
            HistorySource::Tree {
                conversation,
                target,
            } => (tree_history(conversation, *target)?, None),
            HistorySource::Inline {
                messages,
                extra_system,
            } => (inline_history(messages), *extra_system),
        };
        let history = self
            .hooks
            .dispatch_typed(HookPoint::RawAssemblyBefore, history, ctx)
            .await;

        // Keyword scanning never sees reasoning, so both views activate alike
        let scannable: Vec<&HistoryItem> = history
            .iter()
            .filter(|h| h.role != Role::Thinking && !h.text.is_empty())
            .collect();
        let scan: Vec<ScanItem<'_>> = scannable
            .iter()
            .enumerate()
            .map(|(i, h)| ScanItem {
                text: &h.text,
                depth: scannable.len() - 1 - i,
            })
            .collect();
        let activation = activate(&bundle.worldbook_entries, &scan, self.settings.scan_depth);

        let visible: Vec<HistoryItem> = history
            .iter()
            .filter(|h| !h.text.is_empty() && (view == View::User || h.role != Role::Thinking))
            .cloned()
            .collect();
        let raw = assemble_raw(&AssemblyInput {
            bundle: &bundle,
            history: &visible,
            extra_system,
            fired: &activation.fired,
        });
        let raw = self.run_insert_hooks(raw, ctx).await;
        let mut raw = self
            .hooks
            .dispatch_typed(HookPoint::RawAssemblyAfter, raw, ctx)
            .await;
        raw.retain(|item| !item.text.is_empty());
        debug!(items = raw.len(), fired = activation.fired.len(), "Raw stage assembled");

        let (before, after) = match view {
            View::User => (HookPoint::PostprocessUserBefore, HookPoint::PostprocessUserAfter),
            View::Model => (HookPoint::PostprocessModelBefore, HookPoint::PostprocessModelAfter),
        };
        let mut items = self.hooks.dispatch_typed(before, raw.clone(), ctx).await;

        let mut engine = RegexEngine::compile(&bundle.regex_rules);
        engine.apply(RegexPlacement::BeforeMacro, &mut items, view, &variables);
        let after_before_macro_regex = items.clone();

        let macro_ctx = macro_context(&bundle, &visible);
        let mut processor = MacroProcessor::new(&macro_ctx, &mut variables);
        for item in items.iter_mut() {
            item.text = processor.expand(&item.text);
        }
        let after_macro = items.clone();

        engine.apply(RegexPlacement::AfterMacro, &mut items, view, &variables);
        let stages = StageSet {
            raw,
            after_before_macro_regex,
            after_macro,
            after_regex: items,
        };

        let messages = select_output(&stages.after_regex, params.output);
        let messages = self.hooks.dispatch_typed(after, messages, ctx).await;
        let variables = self
            .hooks
            .dispatch_typed(HookPoint::VariablesSaveBefore, variables, ctx)
            .await;

        let debug_opts = &params.debug;
        let result = BuildResult {
            messages,
            variables,
            active_worldbook_entries: activation.fired.iter().map(|f| f.report()).collect(),
            skipped_worldbook_entries: activation.skipped,
            merged_regex: engine.applied_rules(),
            stages: debug_opts.include_stages.then(|| stages.clone()),
            per_item: debug_opts.include_per_item.then(|| stages.per_item()),
            hook_trace: None,
            target_node_id: params.target_node_id.clone(),
        };
        Ok(Prepared {
            result,
            stages,
            bundle,
            loaded_global,
        })
    }

    async fn load_variables(&self, source: &HistorySource<'_>) -> Result<VariableState, PipelineError> {
        let store = self.conversations.variables();
        let global = store.load_global().await?;
        let local = match source {
            HistorySource::Tree { conversation, .. } => store.load_local(&conversation.id).await?,
            HistorySource::Inline { .. } => json!({}),
        };
        Ok(VariableState::new(local, global))
    }

    async fn run_insert_hooks(&self, raw: Vec<SourcedContent>, ctx: &HookContext) -> Vec<SourcedContent> {
        if !self.hooks.has_hooks(HookPoint::RawAssemblyInsert).await {
            return raw;
        }
        let mut kept = Vec::with_capacity(raw.len());
        for item in raw {
            let item = self
                .hooks
                .dispatch_typed(HookPoint::RawAssemblyInsert, item, ctx)
                .await;
            if !item.text.is_empty() {
                kept.push(item);
            }
        }
        kept
    }

    /// Merge the build's variables into the stored ones with the configured
    /// operation. Globals written by other conversations since the build
    /// loaded them are kept; only this build's own edits are carried over.
    ///
    /// The caller holds the conversation lock and the globals lock.
    pub(crate) async fn persist_variables(
        &self,
        conversation_id: &str,
        prepared: &Prepared,
        ctx: &HookContext,
    ) -> Result<(), PipelineError> {
        let store = self.conversations.variables();
        let state = &prepared.result.variables;
        let operation = self.settings.variable_persist;
        let options = MergeOptions::default();

        let local = apply(&store.load_local(conversation_id).await?, &state.local, operation, &options);
        store.save_local(conversation_id, &local).await?;
        let current = store.load_global().await?;
        let ours = rebase(&current, &prepared.loaded_global, &state.global);
        let global = apply(&current, &ours, operation, &options);
        store.save_global(&global).await?;
        debug!(conversation_id, ?operation, "Variables persisted");

        self.hooks
            .dispatch(
                HookPoint::VariablesSaveAfter,
                json!({"local": local, "global": global}),
                ctx,
            )
            .await;
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

/// The path above `target` (or the whole active path), oldest first.
fn tree_history(conversation: &Conversation, target: Option<&str>) -> Result<Vec<HistoryItem>, PipelineError> {
    let tree = &conversation.tree;
    let path = match target {
        Some(target) => {
            let mut path = tree
                .path_to(target)
                .ok_or_else(|| PipelineError::NodeNotFound(target.to_string()))?;
            path.pop();
            path
        }
        None => tree.active_path().to_vec(),
    };
    Ok(path
        .iter()
        .filter_map(|id| tree.node(id))
        .map(|node| HistoryItem {
            node_id: Some(node.id.clone()),
            role: node.role,
            text: node.content.clone(),
        })
        .collect())
}

fn inline_history(messages: &[Message]) -> Vec<HistoryItem> {
    messages
        .iter()
        .map(|m| HistoryItem {
            node_id: None,
            role: m.role,
            text: m.content.clone(),
        })
        .collect()
}

fn macro_context(bundle: &AssetBundle, history: &[HistoryItem]) -> MacroContext {
    let last_with = |role: Option<Role>| {
        history
            .iter()
            .rev()
            .filter(|h| h.role != Role::Thinking)
            .find(|h| role.is_none_or(|r| h.role == r))
            .map(|h| h.text.clone())
            .unwrap_or_default()
    };
    MacroContext {
        user: bundle.persona.name.clone(),
        char: bundle.character.name.clone(),
        description: bundle.character.description.clone(),
        persona: bundle.persona.description.clone(),
        last_message: last_with(None),
        last_user_message: last_with(Some(Role::User)),
        last_char_message: last_with(Some(Role::Assistant)),
    }
}

fn select_output(items: &[SourcedContent], mode: OutputMode) -> Vec<Message> {
    items
        .iter()
        .filter(|item| match mode {
            OutputMode::Full => true,
            OutputMode::History => item.source.is_history(),
            OutputMode::Delta => item.source.is_history() && item.history_depth == Some(0),
        })
        .filter(|item| !item.text.trim().is_empty())
        .map(|item| Message::new(item.role, item.text.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomweave_assets::{
        Activation, Character, EntryPosition, InMemoryAssetStore, AssetKind, RuleMode, WorldBook,
        WorldBookEntry,
    };
    use loomweave_hooks::{HookError, HookRegistration, hook_fn};
    use loomweave_storage::{InMemoryConversationStore, InMemoryVariableStore, NewConversation};
    use serde_json::Value;

    type HookResult = Result<Option<Value>, HookError>;

    async fn orchestrator() -> BuildOrchestrator {
        let assets = InMemoryAssetStore::new();
        let character = Character {
            name: "Mira".into(),
            description: "{{char}} maps the northern wastes.".into(),
            worldbook: Some(WorldBook {
                name: String::new(),
                entries: vec![
                    WorldBookEntry {
                        uid: "1".into(),
                        keys: vec!["dragon".into()],
                        content: "Dragons sleep in winter.".into(),
                        ..Default::default()
                    },
                    WorldBookEntry {
                        uid: "2".into(),
                        content: "Semantic lore.".into(),
                        activation: Activation::Vector,
                        ..Default::default()
                    },
                    WorldBookEntry {
                        uid: "3".into(),
                        content: "It is snowing.".into(),
                        activation: Activation::Always,
                        position: EntryPosition::InChat,
                        depth: 0,
                        ..Default::default()
                    },
                ],
            }),
            ..Default::default()
        };
        assets
            .insert(AssetKind::Character, "mira", serde_json::to_value(&character).unwrap())
            .await;
        assets
            .insert(AssetKind::Persona, "ada", json!({"name": "Ada", "description": "A courier."}))
            .await;

        let service = ConversationService::new(
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(InMemoryVariableStore::new()),
        );
        BuildOrchestrator::new(
            Arc::new(service),
            Arc::new(assets),
            Arc::new(HookDispatcher::default()),
            PipelineConfig::default(),
        )
    }

    fn refs() -> AssetRefs {
        AssetRefs {
            character: Some("mira".into()),
            persona: Some("ada".into()),
            ..Default::default()
        }
    }

    fn inline(messages: Vec<Message>) -> BuildParams {
        BuildParams {
            messages: Some(messages),
            assets: refs(),
            ..Default::default()
        }
    }

    async fn threaded(orch: &BuildOrchestrator) -> String {
        let conv = orch
            .conversations()
            .create(NewConversation {
                id: Some("c1".into()),
                system_prompt: String::new(),
                greeting: Some("Welcome, {{user}}.".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        orch.conversations()
            .append("c1", None, Role::User, "Tell me about the dragon.")
            .await
            .unwrap();
        conv.id
    }

    #[tokio::test]
    async fn inline_build_runs_all_stages() {
        let orch = orchestrator().await;
        let mut params = inline(vec![Message::user("Is there a dragon, {{char}}?")]);
        params.debug.include_stages = true;
        params.debug.include_per_item = true;

        let result = orch.build(params).await.unwrap();
        let stages = result.stages.as_ref().unwrap();
        let tags: Vec<_> = stages.raw.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(
            tags,
            [
                "preset:main",
                "worldbook:Mira#1",
                "persona",
                "char:description",
                "history:0",
                "worldbook:Mira#3",
            ]
        );
        assert_eq!(stages.after_regex[4].text, "Is there a dragon, Mira?");
        assert_eq!(result.messages.last().unwrap().content, "It is snowing.");
        assert_eq!(result.messages[0].content, "Write Mira's next reply in a fictional chat between Mira and Ada.");
        assert_eq!(stages.raw[3].text, "{{char}} maps the northern wastes.");
        assert_eq!(stages.after_macro[3].text, "Mira maps the northern wastes.");

        let fired: Vec<_> = result.active_worldbook_entries.iter().map(|e| e.uid.as_str()).collect();
        assert_eq!(fired, ["1", "3"]);
        assert_eq!(result.skipped_worldbook_entries[0].uid, "2");
        assert_eq!(result.per_item.as_ref().unwrap().len(), stages.raw.len());
    }

    #[tokio::test]
    async fn identical_input_builds_identically() {
        let orch = orchestrator().await;
        let params = || {
            let mut p = inline(vec![Message::user("hello"), Message::assistant("hi")]);
            p.debug.include_stages = true;
            p
        };
        let a = serde_json::to_string(&orch.build(params()).await.unwrap()).unwrap();
        let b = serde_json::to_string(&orch.build(params()).await.unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn output_modes_select_history() {
        let orch = orchestrator().await;
        let messages = vec![Message::user("one"), Message::assistant("two"), Message::user("three")];

        let mut params = inline(messages.clone());
        params.output = OutputMode::History;
        let history = orch.build(params).await.unwrap().messages;
        let texts: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);

        let mut params = inline(messages);
        params.output = OutputMode::Delta;
        let delta = orch.build(params).await.unwrap().messages;
        assert_eq!(delta, [Message::user("three")]);
    }

    #[tokio::test]
    async fn extra_system_leads_inline_history() {
        let orch = orchestrator().await;
        let mut params = inline(vec![Message::user("hi")]);
        params.extra_system = Some("Reply in French.".into());
        params.debug.include_stages = true;
        let result = orch.build(params).await.unwrap();
        let raw = &result.stages.unwrap().raw;
        let pos = raw.iter().position(|i| i.tag == "extra_system").unwrap();
        assert_eq!(raw[pos + 1].tag, "history:0");
    }

    #[tokio::test]
    async fn threaded_build_reads_tree_and_persists_variables() {
        let orch = orchestrator().await;
        let id = threaded(&orch).await;

        let mut params = BuildParams {
            conversation_id: Some(id.clone()),
            assets: refs(),
            output: OutputMode::History,
            ..Default::default()
        };
        params.variables.local = json!({"turns": 1});
        let result = orch.build(params.clone()).await.unwrap();
        let texts: Vec<_> = result.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["Welcome, Ada.", "Tell me about the dragon."]);
        assert_eq!(
            orch.conversations().variables().load_local(&id).await.unwrap(),
            json!({"turns": 1})
        );

        params.variables.local = json!({"turns": 2});
        params.debug.dry_run = true;
        let dry = orch.build(params).await.unwrap();
        assert_eq!(dry.variables.local, json!({"turns": 2}));
        assert_eq!(
            orch.conversations().variables().load_local(&id).await.unwrap(),
            json!({"turns": 1})
        );
    }

    #[tokio::test]
    async fn macros_write_variables_that_persist() {
        let orch = orchestrator().await;
        let id = threaded(&orch).await;
        orch.conversations()
            .append(&id, None, Role::Assistant, "{{incvar::visits}}Hello again.")
            .await
            .unwrap();
        let params = BuildParams {
            conversation_id: Some(id.clone()),
            ..Default::default()
        };
        let result = orch.build(params).await.unwrap();
        assert_eq!(result.variables.local, json!({"visits": 1}));
        assert_eq!(result.messages.last().unwrap().content, "1Hello again.");
        assert_eq!(
            orch.conversations().variables().load_local(&id).await.unwrap(),
            json!({"visits": 1})
        );
    }

    #[tokio::test]
    async fn target_node_limits_history() {
        let orch = orchestrator().await;
        let id = threaded(&orch).await;
        let conv = orch.conversations().get(&id).await.unwrap();
        let user_node = conv.tree.active_tail().to_string();
        let greeting = conv.tree.active_path()[1].clone();

        let params = BuildParams {
            conversation_id: Some(id.clone()),
            output: OutputMode::History,
            target_node_id: Some(user_node.clone()),
            ..Default::default()
        };
        let result = orch.build(params).await.unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.target_node_id.as_deref(), Some(user_node.as_str()));

        let params = BuildParams {
            conversation_id: Some(id),
            target_node_id: Some(greeting),
            output: OutputMode::History,
            ..Default::default()
        };
        assert!(orch.build(params).await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn thinking_nodes_follow_the_view() {
        let orch = orchestrator().await;
        let messages = vec![
            Message::user("q"),
            Message::new(Role::Thinking, "pondering"),
            Message::assistant("a"),
        ];
        let mut params = inline(messages);
        params.output = OutputMode::History;

        params.view = Some(View::Model);
        let model = orch.build(params.clone()).await.unwrap().messages;
        assert!(model.iter().all(|m| m.role != Role::Thinking));

        params.view = Some(View::User);
        let user = orch.build(params).await.unwrap().messages;
        assert!(user.iter().any(|m| m.content == "pondering"));
    }

    #[tokio::test]
    async fn conditional_regex_uses_seeded_variables() {
        let orch = orchestrator().await;
        let mut rule = RegexRule::new("hello", "GRR");
        rule.mode = RuleMode::Conditional;
        rule.condition = Some(r#"var.mood == "angry""#.into());
        let mut unused = RegexRule::new("zzz", "y");
        unused.id = Some("unused".into());
        orch.normalizer
            .store()
            .save(AssetKind::Regex, "moods", &json!([rule, unused]))
            .await
            .unwrap();

        let mut params = inline(vec![Message::user("hello")]);
        params.assets.regex = vec!["moods".into()];
        params.output = OutputMode::History;
        params.variables.local = json!({"mood": "angry"});
        let result = orch.build(params).await.unwrap();
        assert_eq!(result.messages[0].content, "GRR");
        assert_eq!(result.merged_regex.len(), 1);
        assert_eq!(result.merged_regex[0].find, "hello");
    }

    async fn counting_conversation(orch: &BuildOrchestrator, id: &str) {
        orch.conversations()
            .create(NewConversation {
                id: Some(id.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        orch.conversations()
            .append(id, None, Role::User, "{{incglobalvar::visits}}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_builds_keep_every_global_write() {
        let orch = Arc::new(orchestrator().await);
        let slow = HookRegistration::new("slow", 0).on(
            HookPoint::AssetNormalizeBefore,
            hook_fn(|_data: Value, _ctx| async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                HookResult::Ok(None)
            }),
        );
        orch.hooks().register(slow).await.unwrap();

        let ids: Vec<String> = (0..8).map(|i| format!("c{i}")).collect();
        for id in &ids {
            counting_conversation(&orch, id).await;
        }
        let builds: Vec<_> = ids
            .iter()
            .map(|id| {
                let orch = Arc::clone(&orch);
                let params = BuildParams {
                    conversation_id: Some(id.clone()),
                    ..Default::default()
                };
                tokio::spawn(async move { orch.build(params).await })
            })
            .collect();
        for build in builds {
            build.await.unwrap().unwrap();
        }

        let global = orch.conversations().variables().load_global().await.unwrap();
        assert_eq!(global["visits"], json!(8));
    }

    #[tokio::test]
    async fn persisting_globals_keeps_keys_written_elsewhere() {
        let orch = orchestrator().await;
        counting_conversation(&orch, "c1").await;
        let store = Arc::clone(orch.conversations().variables());
        // Another writer lands between this build's load and its save
        let outside = HookRegistration::new("outside", 0).on(
            HookPoint::VariablesSaveBefore,
            hook_fn(move |_data: Value, _ctx| {
                let store = Arc::clone(&store);
                async move {
                    store.save_global(&json!({"weather": "snow"})).await.unwrap();
                    HookResult::Ok(None)
                }
            }),
        );
        orch.hooks().register(outside).await.unwrap();

        let params = BuildParams {
            conversation_id: Some("c1".into()),
            ..Default::default()
        };
        orch.build(params).await.unwrap();
        assert_eq!(
            orch.conversations().variables().load_global().await.unwrap(),
            json!({"weather": "snow", "visits": 1})
        );
    }

    #[tokio::test]
    async fn hooks_rewrite_items_and_messages() {
        let orch = orchestrator().await;
        let registration = HookRegistration::new("shout", 0)
            .on(
                HookPoint::RawAssemblyInsert,
                hook_fn(|mut data: Value, _ctx| async move {
                    if data["tag"] == "persona" {
                        data["text"] = json!("");
                    }
                    HookResult::Ok(Some(data))
                }),
            )
            .on(
                HookPoint::PostprocessModelAfter,
                hook_fn(|data: Value, _ctx| async move {
                    let mut messages: Vec<Message> = serde_json::from_value(data).unwrap();
                    messages.push(Message::system("[end]"));
                    HookResult::Ok(Some(serde_json::to_value(messages).unwrap()))
                }),
            )
            .on(
                HookPoint::VariablesSaveBefore,
                hook_fn(|mut data: Value, _ctx| async move {
                    data["local"]["hooked"] = json!(true);
                    HookResult::Ok(Some(data))
                }),
            );
        orch.hooks().register(registration).await.unwrap();

        let mut params = inline(vec![Message::user("hi")]);
        params.debug.include_stages = true;
        params.debug.include_hook_trace = true;
        let result = orch.build(params).await.unwrap();

        assert!(result.stages.unwrap().raw.iter().all(|i| i.tag != "persona"));
        assert_eq!(result.messages.last().unwrap(), &Message::system("[end]"));
        assert_eq!(result.variables.local["hooked"], json!(true));
        assert!(!result.hook_trace.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_params_and_missing_targets() {
        let orch = orchestrator().await;
        let neither = BuildParams::default();
        assert!(matches!(orch.build(neither).await, Err(PipelineError::InvalidParams(_))));

        let both = BuildParams {
            conversation_id: Some("c1".into()),
            messages: Some(vec![]),
            ..Default::default()
        };
        assert!(matches!(orch.build(both).await, Err(PipelineError::InvalidParams(_))));

        let missing = BuildParams {
            conversation_id: Some("ghost".into()),
            ..Default::default()
        };
        assert!(matches!(
            orch.build(missing).await,
            Err(PipelineError::ConversationNotFound(_))
        ));

        let id = threaded(&orch).await;
        let bad_target = BuildParams {
            conversation_id: Some(id),
            target_node_id: Some("nope".into()),
            ..Default::default()
        };
        assert!(matches!(
            orch.build(bad_target).await,
            Err(PipelineError::NodeNotFound(_))
        ));

        let mut unknown_asset = inline(vec![]);
        unknown_asset.assets.preset = Some("missing".into());
        assert!(matches!(orch.build(unknown_asset).await, Err(PipelineError::Asset(_))));
    }
}
