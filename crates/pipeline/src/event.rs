//! Completion streaming events.
//!
//! A successful stream is `stages?`, `chunk*`, `finish`, `usage`,
//! `postprocess`, `end`. A failed or cancelled one stops at `error`.

use loomweave_core::Usage;
use loomweave_hooks::PostprocessInstruction;
use serde::{Deserialize, Serialize};

use crate::stage::StageSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompleteEvent {
    /// Stage snapshots of the prompt that was sent (when requested).
    Stages { stages: StageSet },

    /// Partial text from the model.
    Chunk { content: String },

    /// Generation stopped; `node_id` is the node the reply was written to.
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finish_reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        content: String,
    },

    Usage { usage: Option<Usage> },

    /// Client instructions emitted by hooks during the request.
    Postprocess {
        instructions: Vec<PostprocessInstruction>,
    },

    Error { code: ErrorCode, message: String },

    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Cancelled,
    Provider,
    Pipeline,
    Storage,
}

impl CompleteEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Stages { .. } => "stages",
            Self::Chunk { .. } => "chunk",
            Self::Finish { .. } => "finish",
            Self::Usage { .. } => "usage",
            Self::Postprocess { .. } => "postprocess",
            Self::Error { .. } => "error",
            Self::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::End)
    }
}
