//! The merge engine.
//!
//! `apply(base, overrides, operation, options)` never mutates its inputs
//! and never fails: malformed paths and missing deletion targets are
//! logged and skipped.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::path::{PathSegment, get_path, parse_path, remove_path};

/// How `overrides` is combined with `base`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOperation {
    /// Result is `overrides` verbatim; array strategy and remove paths are ignored.
    Replace,
    /// Top-level keys only; `overrides` wins per key.
    ShallowMerge,
    /// Recursive object merge; arrays resolved per [`ArrayStrategy`];
    /// scalars and type mismatches take the `overrides` value.
    #[default]
    #[serde(alias = "deep_merge")]
    Merge,
    /// Deep merge with the array strategy forced to `concat`.
    Append,
    /// Deep merge with the array strategy forced to `union`.
    Union,
    /// Deep merge, then delete every entry of `remove_paths`.
    Remove,
}

/// How two arrays at the same position are combined during a deep merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayStrategy {
    /// The `overrides` array wins wholesale.
    #[default]
    Replace,
    /// `base` followed by `overrides`.
    Concat,
    /// `overrides` followed by `base`.
    Prepend,
    /// `base` followed by `overrides`, dropping later duplicates by value.
    Union,
    /// Like `union`, but object elements are compared by the value at
    /// `array_key`; elements where the key is unreadable fall back to
    /// value comparison.
    UnionByKey,
}

/// Tuning for [`apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    #[serde(default)]
    pub array_strategy: ArrayStrategy,

    /// Key path used by [`ArrayStrategy::UnionByKey`] (e.g. `id`, `meta.id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_key: Option<String>,

    /// Paths deleted after merging. Ignored by [`MergeOperation::Replace`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_paths: Vec<String>,
}

/// Standalone merge API request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeRequest {
    #[serde(default)]
    pub base: Value,
    #[serde(default)]
    pub overrides: Value,
    #[serde(default)]
    pub operation: MergeOperation,
    #[serde(default)]
    pub options: MergeOptions,
}

/// Standalone merge API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResponse {
    pub result: Value,
}

impl MergeRequest {
    pub fn execute(&self) -> MergeResponse {
        MergeResponse {
            result: apply(&self.base, &self.overrides, self.operation, &self.options),
        }
    }
}

struct ArrayRules {
    strategy: ArrayStrategy,
    key: Option<Vec<PathSegment>>,
}

/// Combine `base` and `overrides` according to `operation` and `options`.
///
/// A `null` `overrides` means "nothing to merge" for every operation except
/// [`MergeOperation::Replace`].
pub fn apply(
    base: &Value,
    overrides: &Value,
    operation: MergeOperation,
    options: &MergeOptions,
) -> Value {
    if operation == MergeOperation::Replace {
        return overrides.clone();
    }

    let strategy = match operation {
        MergeOperation::Append => ArrayStrategy::Concat,
        MergeOperation::Union => ArrayStrategy::Union,
        _ => options.array_strategy,
    };
    let key = match (&options.array_key, strategy) {
        (Some(raw), ArrayStrategy::UnionByKey) => match parse_path(raw) {
            Ok(segments) => Some(segments),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable array_key; falling back to value dedup");
                None
            }
        },
        _ => None,
    };
    let rules = ArrayRules { strategy, key };

    let mut result = if overrides.is_null() {
        base.clone()
    } else if operation == MergeOperation::ShallowMerge {
        shallow_merge(base, overrides)
    } else {
        deep_merge(base, overrides, &rules)
    };

    for raw in &options.remove_paths {
        match parse_path(raw) {
            Ok(segments) => {
                if !remove_path(&mut result, &segments) {
                    debug!(path = %raw, "Remove path not present, skipping");
                }
            }
            Err(e) => warn!(error = %e, "Skipping malformed remove path"),
        }
    }

    result
}

/// Three-way merge: carry the edits that turned `base` into `ours` over to
/// `current`, keeping whatever else changed in `current` since `base` was
/// read. Objects are compared key by key; any other change to a value
/// replaces it wholesale.
///
/// ```text
/// base    {a:1, b:1, c:1}
/// ours    {a:2, b:1}          (a changed, c deleted)
/// current {a:1, b:5, c:1, d:0}
///      => {a:2, b:5, d:0}
/// ```
pub fn rebase(current: &Value, base: &Value, ours: &Value) -> Value {
    if ours == base {
        return current.clone();
    }
    let (Value::Object(c), Value::Object(b), Value::Object(o)) = (current, base, ours) else {
        return ours.clone();
    };
    let mut out = c.clone();
    for (key, value) in o {
        match (b.get(key), c.get(key)) {
            (Some(before), Some(now)) => {
                out.insert(key.clone(), rebase(now, before, value));
            }
            (Some(before), None) if before == value => {}
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    for key in b.keys().filter(|k| !o.contains_key(*k)) {
        out.remove(key);
    }
    Value::Object(out)
}

fn shallow_merge(base: &Value, overrides: &Value) -> Value {
    match (base, overrides) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (key, value) in o {
                out.insert(key.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => overrides.clone(),
    }
}

fn deep_merge(base: &Value, overrides: &Value, rules: &ArrayRules) -> Value {
    match (base, overrides) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out: Map<String, Value> = b.clone();
            for (key, value) in o {
                let merged = match b.get(key) {
                    Some(existing) => deep_merge(existing, value, rules),
                    None => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        (Value::Array(b), Value::Array(o)) => Value::Array(merge_arrays(b, o, rules)),
        _ => overrides.clone(),
    }
}

fn merge_arrays(base: &[Value], overrides: &[Value], rules: &ArrayRules) -> Vec<Value> {
    let chained = || base.iter().chain(overrides.iter());
    match rules.strategy {
        ArrayStrategy::Replace => overrides.to_vec(),
        ArrayStrategy::Concat => chained().cloned().collect(),
        ArrayStrategy::Prepend => overrides.iter().chain(base.iter()).cloned().collect(),
        ArrayStrategy::Union => dedup_by_value(chained()),
        ArrayStrategy::UnionByKey => match &rules.key {
            Some(key) => dedup_by_key(chained(), key),
            None => dedup_by_value(chained()),
        },
    }
}

fn dedup_by_value<'a>(items: impl Iterator<Item = &'a Value>) -> Vec<Value> {
    let mut kept: Vec<Value> = Vec::new();
    for item in items {
        if !kept.contains(item) {
            kept.push(item.clone());
        }
    }
    kept
}

fn dedup_by_key<'a>(items: impl Iterator<Item = &'a Value>, key: &[PathSegment]) -> Vec<Value> {
    let mut kept: Vec<Value> = Vec::new();
    let mut seen_keys: Vec<&Value> = Vec::new();
    for item in items {
        match get_path(item, key) {
            Some(k) => {
                if !seen_keys.contains(&k) {
                    seen_keys.push(k);
                    kept.push(item.clone());
                }
            }
            None => {
                if !kept.contains(item) {
                    kept.push(item.clone());
                }
            }
        }
    }
    kept
}
