//! Local (per conversation) and global variable maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::merge::{MergeOperation, MergeOptions, apply};
use crate::path::{get_path, parse_path, set_path};
use crate::VariableError;

/// Which map a variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableScope {
    Local,
    Global,
}

/// The variable state visible to one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    #[serde(default = "empty_object")]
    pub local: Value,
    #[serde(default = "empty_object")]
    pub global: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for VariableState {
    fn default() -> Self {
        Self {
            local: empty_object(),
            global: empty_object(),
        }
    }
}

/// Caller-supplied values merged into the state before a build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableSeed {
    #[serde(default)]
    pub local: Value,
    #[serde(default)]
    pub global: Value,
    #[serde(default)]
    pub operation: MergeOperation,
    #[serde(default)]
    pub options: MergeOptions,
}

impl VariableState {
    pub fn new(local: Value, global: Value) -> Self {
        Self { local, global }
    }

    pub fn scope(&self, scope: VariableScope) -> &Value {
        match scope {
            VariableScope::Local => &self.local,
            VariableScope::Global => &self.global,
        }
    }

    pub fn scope_mut(&mut self, scope: VariableScope) -> &mut Value {
        match scope {
            VariableScope::Local => &mut self.local,
            VariableScope::Global => &mut self.global,
        }
    }

    /// Read a variable by path expression.
    pub fn get(&self, scope: VariableScope, path: &str) -> Option<&Value> {
        let segments = parse_path(path).ok()?;
        get_path(self.scope(scope), &segments)
    }

    /// Write a variable by path expression.
    pub fn set(&mut self, scope: VariableScope, path: &str, value: Value) -> Result<(), VariableError> {
        let segments = parse_path(path)?;
        set_path(self.scope_mut(scope), &segments, value)
    }

    /// Merge a seed into both scopes. A `null` seed half leaves its scope alone.
    pub fn apply_seed(&mut self, seed: &VariableSeed) {
        for scope in [VariableScope::Local, VariableScope::Global] {
            let overrides = match scope {
                VariableScope::Local => &seed.local,
                VariableScope::Global => &seed.global,
            };
            if overrides.is_null() {
                continue;
            }
            let merged = apply(self.scope(scope), overrides, seed.operation, &seed.options);
            debug!(?scope, operation = ?seed.operation, "Applied variable seed");
            *self.scope_mut(scope) = merged;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_state_has_empty_objects() {
        let state = VariableState::default();
        assert_eq!(state.local, json!({}));
        assert_eq!(state.global, json!({}));
    }

    #[test]
    fn set_and_get_by_path() {
        let mut state = VariableState::default();
        state.set(VariableScope::Local, "stats.hp", json!(12)).unwrap();
        state.set(VariableScope::Global, "mode", json!("dark")).unwrap();
        assert_eq!(state.get(VariableScope::Local, "stats.hp"), Some(&json!(12)));
        assert_eq!(state.get(VariableScope::Global, "mode"), Some(&json!("dark")));
        assert_eq!(state.get(VariableScope::Local, "mode"), None);
    }

    #[test]
    fn seed_merges_each_scope_independently() {
        let mut state = VariableState::new(json!({"a": 1, "tags": ["x"]}), json!({"g": 1}));
        let seed = VariableSeed {
            local: json!({"tags": ["y"]}),
            global: Value::Null,
            operation: MergeOperation::Append,
            options: MergeOptions::default(),
        };
        state.apply_seed(&seed);
        assert_eq!(state.local, json!({"a": 1, "tags": ["x", "y"]}));
        assert_eq!(state.global, json!({"g": 1}));
    }

    #[test]
    fn missing_fields_deserialize_to_empty_objects() {
        let state: VariableState = serde_json::from_str("{}").unwrap();
        assert_eq!(state, VariableState::default());
    }
}
