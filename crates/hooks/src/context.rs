//! Per-request state shared by every hook callback of one pipeline run.

use loomweave_core::View;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::HookPoint;

/// An instruction for the client, produced by a hook and delivered in the
/// `postprocess` event of a completion stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessInstruction {
    pub plugin_id: String,
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    Changed,
    Unchanged,
    Failed,
    Panicked,
    TimedOut,
}

/// One callback execution, recorded for debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTraceEntry {
    pub point: HookPoint,
    pub strategy_id: String,
    pub outcome: HookOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The serialisable part of a [`HookContext`], as sent to HTTP plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookContextInfo {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub view: View,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<HookPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
}

/// Handed to every callback. Cheap to clone; clones share the emitted
/// instructions and trace.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub view: View,
    pub dry_run: bool,
    /// Set by the dispatcher before each callback runs
    pub point: Option<HookPoint>,
    /// Set by the dispatcher before each callback runs
    pub strategy_id: Option<String>,
    emitted: Arc<Mutex<Vec<PostprocessInstruction>>>,
    trace: Arc<Mutex<Vec<HookTraceEntry>>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl HookContext {
    pub fn new(conversation_id: Option<String>, view: View, dry_run: bool) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            view,
            dry_run,
            point: None,
            strategy_id: None,
            emitted: Arc::default(),
            trace: Arc::default(),
        }
    }

    /// Queue a client instruction on behalf of the running strategy.
    pub fn emit(&self, operation: impl Into<String>, payload: Value) {
        let plugin_id = self.strategy_id.clone().unwrap_or_default();
        locked(&self.emitted).push(PostprocessInstruction {
            plugin_id,
            operation: operation.into(),
            payload,
        });
    }

    /// Everything emitted so far, in emission order.
    pub fn instructions(&self) -> Vec<PostprocessInstruction> {
        locked(&self.emitted).clone()
    }

    pub fn trace(&self) -> Vec<HookTraceEntry> {
        locked(&self.trace).clone()
    }

    pub(crate) fn record(&self, entry: HookTraceEntry) {
        locked(&self.trace).push(entry);
    }

    pub(crate) fn for_callback(&self, point: HookPoint, strategy_id: &str) -> Self {
        Self {
            point: Some(point),
            strategy_id: Some(strategy_id.to_string()),
            ..self.clone()
        }
    }

    pub fn info(&self) -> HookContextInfo {
        HookContextInfo {
            request_id: self.request_id.clone(),
            conversation_id: self.conversation_id.clone(),
            view: self.view,
            dry_run: self.dry_run,
            point: self.point,
            strategy_id: self.strategy_id.clone(),
        }
    }
}
