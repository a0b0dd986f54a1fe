// SPDX-License-Identifier: MIT

//! Runtime state for workflow execution
//!
//! A [`GraphState`] is never mutated once handed to a node. The executor
//! produces a fresh value per step through [`GraphState::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::annotation::AnnotationRoot;

/// Keys owned by the engine; updates to them are rejected
pub const RESERVED_KEYS: [&str; 3] = ["execution_id", "last_updated", "outputs"];

/// Workflow state: base fields plus domain fields
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphState {
    pub execution_id: String,
    pub last_updated: DateTime<Utc>,
    /// Raw result of each executed node, keyed by node id
    pub outputs: Map<String, Value>,
    fields: Map<String, Value>,
}

/// Partial state produced by one node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct StateUpdate(Map<String, Value>);

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Shallow-merge another update into this one (later keys win)
    pub fn extend(&mut self, other: StateUpdate) {
        self.0.extend(other.0);
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for StateUpdate {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for StateUpdate {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A field dropped during merge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RejectedField {
    pub field: String,
    pub reason: String,
}

/// What a merge actually did
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MergeReport {
    /// The subset of the update that was merged
    pub applied: StateUpdate,
    pub rejected: Vec<RejectedField>,
}

impl GraphState {
    /// Create an empty state with a fresh execution id
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            last_updated: Utc::now(),
            outputs: Map::new(),
            fields: Map::new(),
        }
    }

    /// Create a state seeded with every schema default
    pub fn from_schema(schema: &AnnotationRoot) -> Self {
        Self {
            fields: schema.defaults(),
            ..Self::new()
        }
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    /// Builder-style field insert (bypasses reducers; for seeding)
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get a field value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Get a nested field value using dot notation (e.g., "result.intent")
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                other => other.get(part)?,
            };
        }
        Some(current)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Raw result recorded for a node
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Merge an update, returning a fresh state and a report
    ///
    /// Declared fields go through their reducer and type check; undeclared
    /// fields are replaced. Reserved keys and type mismatches are rejected.
    pub fn apply(
        &self,
        update: &StateUpdate,
        schema: Option<&AnnotationRoot>,
    ) -> (GraphState, MergeReport) {
        let mut next = self.clone();
        let mut report = MergeReport::default();

        for (key, value) in update.iter() {
            if RESERVED_KEYS.contains(&key.as_str()) {
                report.rejected.push(RejectedField {
                    field: key.clone(),
                    reason: "reserved key".to_string(),
                });
                continue;
            }

            match schema.and_then(|s| s.get(key)) {
                Some(annotation) => {
                    if !annotation.accepts(value) {
                        report.rejected.push(RejectedField {
                            field: key.clone(),
                            reason: format!(
                                "expected {:?}, got {}",
                                annotation.field_type(),
                                json_type_name(value)
                            ),
                        });
                        continue;
                    }
                    let current = next
                        .fields
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| annotation.default_value());
                    let merged = annotation.reduce(&current, value.clone());
                    next.fields.insert(key.clone(), merged);
                }
                None => {
                    next.fields.insert(key.clone(), value.clone());
                }
            }
            report.applied.insert(key.clone(), value.clone());
        }

        next.last_updated = Utc::now();
        (next, report)
    }

    /// Record a node's raw result (existing keys are overwritten, never removed)
    pub fn with_output(mut self, node_id: impl Into<String>, output: Value) -> Self {
        self.outputs.insert(node_id.into(), output);
        self
    }

    /// Convert state to a JSON object
    pub fn to_json(&self) -> Value {
        let mut obj = self.fields.clone();
        obj.insert("execution_id".into(), Value::String(self.execution_id.clone()));
        obj.insert(
            "last_updated".into(),
            Value::String(self.last_updated.to_rfc3339()),
        );
        obj.insert("outputs".into(), Value::Object(self.outputs.clone()));
        Value::Object(obj)
    }
}

impl Default for GraphState {
    fn default() -> Self {
        Self::new()
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
