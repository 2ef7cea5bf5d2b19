//! Creating and merging workflow state.
//!
//! State is never mutated in place: `merge_state` returns a new value with
//! `outputs` shallow-unioned, other fields replaced and `last_updated`
//! refreshed (and never moved backwards). Field names that collide with the
//! state's own keys are dropped.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::warn;

use waypoint_core::state::{is_reserved_key, StateUpdate, WorkflowState};
use waypoint_core::types::new_execution_id;

/// Fresh state for a new execution. A missing id gets a generated one.
pub fn init_state(execution_id: Option<String>, fields: Map<String, Value>) -> WorkflowState {
    let mut state = WorkflowState::new(execution_id.unwrap_or_else(new_execution_id));
    state.fields = without_reserved(fields);
    state
}

/// Drop fields named like the state's own keys.
pub fn without_reserved(fields: Map<String, Value>) -> Map<String, Value> {
    fields
        .into_iter()
        .filter(|(key, _)| {
            let reserved = is_reserved_key(key);
            if reserved {
                warn!(key = %key, "Ignoring state field with a reserved name");
            }
            !reserved
        })
        .collect()
}

/// Merge a partial update into `state`, returning the merged copy.
pub fn merge_state(state: &WorkflowState, update: &StateUpdate) -> WorkflowState {
    let mut merged = state.clone();
    merged
        .outputs
        .extend(update.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in &update.fields {
        if is_reserved_key(key) {
            warn!(key = %key, "Ignoring update to a reserved state key");
            continue;
        }
        merged.fields.insert(key.clone(), value.clone());
    }
    merged.last_updated = Utc::now().max(state.last_updated);
    merged
}
