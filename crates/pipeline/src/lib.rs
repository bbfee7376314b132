//! # Loomweave Pipeline
//!
//! Turns a conversation (or an inline message list) plus named assets into
//! the message list a model sees, in four recorded stages:
//!
//! ```text
//! raw ─▶ after_before_macro_regex ─▶ after_macro ─▶ after_regex
//! ```
//!
//! The [`BuildOrchestrator`] sequences asset normalization, world-book
//! activation, assembly, regex and macro stages and variable persistence,
//! firing hooks at every step. [`BuildOrchestrator::complete`] continues a
//! build into a streamed model call and writes the reply back to the tree.

pub mod assembler;
pub mod cancel;
pub mod complete;
pub mod condition;
pub mod event;
pub mod macros;
pub mod orchestrator;
pub mod regex_stage;
pub mod stage;
pub mod worldbook;

pub use cancel::{CancelHandle, CancelRegistry};
pub use complete::{CompleteStream, FixedProvider, ProviderSource, ResolvedModel, merge_llm};
pub use event::{CompleteEvent, ErrorCode};
pub use orchestrator::{BuildOrchestrator, BuildParams, BuildResult, DebugOptions, OutputMode};
pub use stage::{PerItemTrace, Source, SourcedContent, StageSet};
pub use worldbook::{ActivatedEntry, ActivationReason, SkipReason, SkippedEntry};

use loomweave_assets::AssetError;
use loomweave_core::ProviderError;
use loomweave_storage::StorageError;

/// Pipeline errors. Everything here aborts the request; tolerable misses
/// are logged where they happen instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid build parameters: {0}")]
    InvalidParams(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => PipelineError::ConversationNotFound(id),
            other => PipelineError::Storage(other),
        }
    }
}
