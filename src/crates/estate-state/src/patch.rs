//! State patches and per-field merge policies.
//!
//! Nodes never mutate run state in place. They return a [`StatePatch`] — a
//! set of field updates — and the store applies it to the checkpointed
//! document under a [`PatchSchema`] that declares how each field merges:
//!
//! | Reducer | Behavior |
//! |---------|----------|
//! | [`OverwriteReducer`] | Last write wins (the default) |
//! | [`MergeMapReducer`] | Object merge, update wins per key |
//! | [`CounterReducer`] | Object merge, integer values add per key |
//! | [`AppendReducer`] | Array concatenation |
//! | [`AppendUniqueReducer`] | Array concatenation, duplicates dropped, order kept |
//!
//! [`run_state_schema`] registers the merge policies the workflow engine
//! relies on (accumulating worker results, error maps, timings and paths
//! across waves and retries).

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::PatchError;

/// A set of field updates produced by one node.
///
/// Field order is irrelevant; each field is merged independently under the
/// schema's reducer for that field. A *replacing* patch resets the whole
/// document instead of merging — used when a new run re-ingests an existing
/// thread.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    fields: Map<String, Value>,
    replace: bool,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// A patch that replaces the entire document with `doc` (which must be
    /// an object). Reducers do not run; the commit is still versioned and
    /// atomic.
    pub fn replace_with(doc: Map<String, Value>) -> Self {
        Self {
            fields: doc,
            replace: true,
        }
    }

    /// Add or replace a field update. Values must already be JSON.
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_replace(&self) -> bool {
        self.replace
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

impl From<Map<String, Value>> for StatePatch {
    fn from(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            replace: false,
        }
    }
}

/// Merge policy for a single state field.
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current`. `current` is `Null` when the field is
    /// absent from the document.
    fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, PatchError>;

    /// Stable name used in error messages.
    fn name(&self) -> &'static str;
}

/// Replaces the current value with the update.
#[derive(Debug, Clone)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, _field: &str, _current: &Value, update: &Value) -> Result<Value, PatchError> {
        Ok(update.clone())
    }

    fn name(&self) -> &'static str {
        "overwrite"
    }
}

/// Merges two objects key-wise; the update wins on conflicting keys.
#[derive(Debug, Clone)]
pub struct MergeMapReducer;

impl Reducer for MergeMapReducer {
    fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, PatchError> {
        match (current, update) {
            (Value::Object(curr), Value::Object(upd)) => {
                let mut merged = curr.clone();
                for (key, value) in upd {
                    merged.insert(key.clone(), value.clone());
                }
                Ok(Value::Object(merged))
            }
            (Value::Null, Value::Object(upd)) => Ok(Value::Object(upd.clone())),
            _ => Err(PatchError::Reduce {
                reducer: self.name(),
                field: field.to_string(),
                detail: "both values must be objects".to_string(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "merge_map"
    }
}

/// Merges two objects of integer counters, adding values per key.
#[derive(Debug, Clone)]
pub struct CounterReducer;

impl Reducer for CounterReducer {
    fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, PatchError> {
        let mut merged = match current {
            Value::Object(curr) => curr.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(PatchError::Reduce {
                    reducer: self.name(),
                    field: field.to_string(),
                    detail: "current value must be an object".to_string(),
                })
            }
        };

        let upd = update.as_object().ok_or_else(|| PatchError::Reduce {
            reducer: self.name(),
            field: field.to_string(),
            detail: "update must be an object".to_string(),
        })?;

        for (key, value) in upd {
            let add = value.as_i64().ok_or_else(|| PatchError::Reduce {
                reducer: self.name(),
                field: field.to_string(),
                detail: format!("counter '{}' is not an integer", key),
            })?;
            let base = merged.get(key).and_then(Value::as_i64).unwrap_or(0);
            merged.insert(key.clone(), Value::from(base + add));
        }

        Ok(Value::Object(merged))
    }

    fn name(&self) -> &'static str {
        "counter"
    }
}

/// Concatenates arrays. A scalar update is appended as one element.
#[derive(Debug, Clone)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, PatchError> {
        match (current, update) {
            (Value::Array(curr), Value::Array(upd)) => {
                let mut merged = curr.clone();
                merged.extend_from_slice(upd);
                Ok(Value::Array(merged))
            }
            (Value::Null, Value::Array(upd)) => Ok(Value::Array(upd.clone())),
            (Value::Array(curr), single) => {
                let mut merged = curr.clone();
                merged.push(single.clone());
                Ok(Value::Array(merged))
            }
            (Value::Null, single) => Ok(Value::Array(vec![single.clone()])),
            _ => Err(PatchError::Reduce {
                reducer: self.name(),
                field: field.to_string(),
                detail: "current value must be an array".to_string(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "append"
    }
}

/// Like [`AppendReducer`] but drops elements already present, preserving the
/// order of first appearance.
#[derive(Debug, Clone)]
pub struct AppendUniqueReducer;

impl Reducer for AppendUniqueReducer {
    fn reduce(&self, field: &str, current: &Value, update: &Value) -> Result<Value, PatchError> {
        let appended = AppendReducer.reduce(field, current, update)?;
        let items = match appended {
            Value::Array(items) => items,
            other => return Ok(other),
        };

        let mut unique: Vec<Value> = Vec::with_capacity(items.len());
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Ok(Value::Array(unique))
    }

    fn name(&self) -> &'static str {
        "append_unique"
    }
}

/// Registry of per-field merge policies.
///
/// Fields without an explicit reducer use overwrite semantics.
#[derive(Default)]
pub struct PatchSchema {
    fields: HashMap<String, Box<dyn Reducer>>,
}

impl PatchSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reducer for a field, replacing any previous registration.
    pub fn field(mut self, name: impl Into<String>, reducer: Box<dyn Reducer>) -> Self {
        self.fields.insert(name.into(), reducer);
        self
    }

    /// Apply a patch to a state document in place.
    ///
    /// Each patched field is merged independently; the whole application is
    /// all-or-nothing from the caller's perspective because the store only
    /// commits the document after `apply` returns `Ok`.
    pub fn apply(&self, doc: &mut Value, patch: &StatePatch) -> Result<(), PatchError> {
        if patch.is_replace() {
            let mut fields = Map::new();
            for (field, update) in patch.fields() {
                fields.insert(field.clone(), update.clone());
            }
            *doc = Value::Object(fields);
            return Ok(());
        }

        let obj = doc.as_object_mut().ok_or(PatchError::NotAnObject)?;

        for (field, update) in patch.fields() {
            let current = obj.get(field).cloned().unwrap_or(Value::Null);
            let merged = match self.fields.get(field) {
                Some(reducer) => reducer.reduce(field, &current, update)?,
                None => update.clone(),
            };
            obj.insert(field.clone(), merged);
        }

        Ok(())
    }

    pub fn registered_fields(&self) -> Vec<&str> {
        self.fields.keys().map(String::as_str).collect()
    }
}

/// Merge policies for the workflow engine's run-state document.
///
/// Accumulating fields survive wave commits and retries instead of being
/// clobbered by the latest node:
/// - `worker_results` and `errors` merge per worker name, last write wins;
/// - `error_counts` adds per error kind;
/// - `per_node_timings` and `agent_path` append;
/// - `insights` appends without duplicates.
pub fn run_state_schema() -> PatchSchema {
    PatchSchema::new()
        .field("worker_results", Box::new(MergeMapReducer))
        .field("errors", Box::new(MergeMapReducer))
        .field("error_counts", Box::new(CounterReducer))
        .field("per_node_timings", Box::new(AppendReducer))
        .field("agent_path", Box::new(AppendReducer))
        .field("insights", Box::new(AppendUniqueReducer))
}
