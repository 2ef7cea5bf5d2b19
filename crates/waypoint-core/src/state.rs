use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::NodeId;

/// Top-level keys owned by [`WorkflowState`]. They cannot be used as field names.
pub const RESERVED_KEYS: [&str; 3] = ["execution_id", "last_updated", "outputs"];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Root of every workflow state.
///
/// The executor only ever looks at `execution_id`, `last_updated` and
/// `outputs`. Workflow-specific data lives in `fields`, which is flattened
/// into the same JSON object when serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: String,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub outputs: BTreeMap<NodeId, Value>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkflowState {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            last_updated: Utc::now(),
            outputs: BTreeMap::new(),
            fields: Map::new(),
        }
    }

    /// Set a workflow field (builder-style, for seeding initial state).
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.fields.get(key).and_then(|v| v.as_bool())
    }

    /// Output recorded by a previously executed node.
    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    pub fn has_output(&self, node_id: &str) -> bool {
        self.outputs.contains_key(node_id)
    }

    /// The whole state as a JSON object (used for schema validation and templates).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A partial state update returned by a node.
///
/// `outputs` entries are unioned into the existing outputs; `fields` entries
/// replace the existing values wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<NodeId, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node output.
    pub fn output(mut self, node_id: impl Into<NodeId>, value: Value) -> Self {
        self.outputs.insert(node_id.into(), value);
        self
    }

    /// Replace a workflow field.
    pub fn set(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Fold another update into this one; entries in `other` win.
    pub fn extend(mut self, other: StateUpdate) -> Self {
        self.outputs.extend(other.outputs);
        self.fields.extend(other.fields);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.fields.is_empty()
    }

    /// The field part of the update as a JSON object (for output schemas).
    pub fn fields_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors() {
        let state = WorkflowState::new("exec-1")
            .with_field("score", json!(70))
            .with_field("name", json!("draft"))
            .with_field("ok", json!(true));

        assert_eq!(state.get_i64("score"), Some(70));
        assert_eq!(state.get_f64("score"), Some(70.0));
        assert_eq!(state.get_str("name"), Some("draft"));
        assert_eq!(state.get_bool("ok"), Some(true));
        assert_eq!(state.get("missing"), None);
        assert!(!state.has_output("n1"));
    }

    #[test]
    fn test_fields_flatten_in_json() {
        let mut state = WorkflowState::new("exec-1").with_field("count", json!(2));
        state.outputs.insert("a".into(), json!("done"));

        let value = state.to_value();
        assert_eq!(value["execution_id"], "exec-1");
        assert_eq!(value["count"], 2);
        assert_eq!(value["outputs"]["a"], "done");

        let parsed: WorkflowState = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_update_builder() {
        let update = StateUpdate::new()
            .output("a", json!(1))
            .set("x", json!("y"))
            .extend(StateUpdate::new().set("x", json!("z")));
        assert_eq!(update.outputs.get("a"), Some(&json!(1)));
        assert_eq!(update.fields.get("x"), Some(&json!("z")));
        assert!(!update.is_empty());
        assert!(StateUpdate::new().is_empty());
    }
}
