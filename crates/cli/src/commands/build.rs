use clap::Args;
use loomweave_core::{Message, View};
use loomweave_gateway::AppState;
use loomweave_pipeline::{BuildParams, CompleteEvent, OutputMode};
use loomweave_variables::MergeOperation;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use super::{CmdResult, load_config, parse_name, print_json, read_json};

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Full request as JSON or @file; the flags below override its fields
    #[arg(long)]
    pub params: Option<String>,

    /// Build from a stored conversation
    #[arg(short, long, conflicts_with = "messages")]
    pub conversation: Option<String>,

    /// Build from inline messages: JSON array or @file
    #[arg(short, long)]
    pub messages: Option<String>,

    /// Instruction placed ahead of inline messages
    #[arg(long)]
    pub system: Option<String>,

    #[arg(long)]
    pub character: Option<String>,

    #[arg(long)]
    pub persona: Option<String>,

    #[arg(long)]
    pub preset: Option<String>,

    /// World book name (repeatable)
    #[arg(long = "worldbook")]
    pub worldbooks: Vec<String>,

    /// Regex set name (repeatable)
    #[arg(long)]
    pub regex: Vec<String>,

    #[arg(long)]
    pub llm_config: Option<String>,

    /// user | model
    #[arg(long, value_parser = parse_name::<View>)]
    pub view: Option<View>,

    /// full | history | delta
    #[arg(long, value_parser = parse_name::<OutputMode>)]
    pub output: Option<OutputMode>,

    /// Node a reply would be written to
    #[arg(long)]
    pub target: Option<String>,

    /// Conversation-local variable seed: JSON or @file
    #[arg(long)]
    pub vars: Option<String>,

    /// Global variable seed: JSON or @file
    #[arg(long)]
    pub global_vars: Option<String>,

    /// How the seeds combine with stored variables
    #[arg(long, value_parser = parse_name::<MergeOperation>)]
    pub vars_mode: Option<MergeOperation>,

    /// Include stage snapshots
    #[arg(long)]
    pub stages: bool,

    /// Include the per-item trace
    #[arg(long)]
    pub per_item: bool,

    /// Include the hook trace
    #[arg(long)]
    pub hook_trace: bool,

    /// Persist nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Send the prompt to the configured model and stream the reply
    #[arg(long)]
    pub complete: bool,
}

impl BuildArgs {
    pub fn into_params(self) -> CmdResult<BuildParams> {
        let mut params: BuildParams = match &self.params {
            Some(raw) => serde_json::from_value(read_json(raw)?)
                .map_err(|e| format!("Invalid build params: {e}"))?,
            None => BuildParams::default(),
        };

        if let Some(id) = self.conversation {
            params.conversation_id = Some(id);
            params.messages = None;
        }
        if let Some(raw) = &self.messages {
            let messages: Vec<Message> = serde_json::from_value(read_json(raw)?)
                .map_err(|e| format!("Invalid messages: {e}"))?;
            params.messages = Some(messages);
            params.conversation_id = None;
        }
        if self.system.is_some() {
            params.extra_system = self.system;
        }

        let assets = &mut params.assets;
        if self.character.is_some() {
            assets.character = self.character;
        }
        if self.persona.is_some() {
            assets.persona = self.persona;
        }
        if self.preset.is_some() {
            assets.preset = self.preset;
        }
        if self.llm_config.is_some() {
            assets.llm_config = self.llm_config;
        }
        assets.worldbooks.extend(self.worldbooks);
        assets.regex.extend(self.regex);

        if self.view.is_some() {
            params.view = self.view;
        }
        if let Some(output) = self.output {
            params.output = output;
        }
        if self.target.is_some() {
            params.target_node_id = self.target;
        }

        if let Some(raw) = &self.vars {
            params.variables.local = read_json(raw)?;
        }
        if let Some(raw) = &self.global_vars {
            params.variables.global = read_json(raw)?;
        }
        if let Some(mode) = self.vars_mode {
            params.variables.operation = mode;
        }

        let debug = &mut params.debug;
        debug.include_stages |= self.stages;
        debug.include_per_item |= self.per_item;
        debug.include_hook_trace |= self.hook_trace;
        debug.dry_run |= self.dry_run;

        Ok(params)
    }
}

pub async fn run(args: BuildArgs) -> CmdResult {
    let config = load_config()?;
    let state = AppState::from_config(&config)?;
    let complete = args.complete;
    let params = args.into_params()?;
    params.validate()?;
    debug!(
        conversation = ?params.conversation_id,
        data_dir = %config.storage.data_dir.display(),
        complete,
        "Running build"
    );

    if !complete {
        let result = state.orchestrator.build(params).await?;
        return print_json(&result);
    }

    let mut stream = state
        .orchestrator
        .complete(params, Arc::clone(&state.providers))
        .await?;
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.events.recv().await {
        match event {
            CompleteEvent::Chunk { content } => {
                write!(stdout, "{content}")?;
                stdout.flush()?;
            }
            CompleteEvent::Finish { node_id, .. } => {
                writeln!(stdout)?;
                if let Some(id) = node_id {
                    eprintln!("💾 Saved reply as node {id}");
                }
            }
            CompleteEvent::Error { code, message } => {
                return Err(format!("Completion failed ({code:?}): {message}").into());
            }
            CompleteEvent::End => break,
            _ => {}
        }
    }
    Ok(())
}
