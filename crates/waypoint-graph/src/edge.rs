use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use waypoint_core::state::WorkflowState;
use waypoint_core::types::NodeId;

/// Predicate over the merged workflow state.
pub type Condition = Arc<dyn Fn(&WorkflowState) -> bool + Send + Sync>;

/// Wrap a closure as a [`Condition`].
pub fn condition(f: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static) -> Condition {
    Arc::new(f)
}

/// A directed edge between two nodes.
#[derive(Clone)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub condition: EdgeCondition,
    /// Structural tag, e.g. `if-true` or `parallel-branch`.
    pub label: Option<String>,
}

/// Condition for traversing an edge.
#[derive(Clone, Default)]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression matches the state.
    /// See [`evaluate_condition`].
    Expr(String),
    /// Traverse if the predicate holds.
    Predicate(Condition),
}

impl fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("condition", &self.condition)
            .field("label", &self.label)
            .finish()
    }
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            label: None,
        }
    }

    /// Create an edge guarded by a predicate.
    pub fn when(from: impl Into<NodeId>, to: impl Into<NodeId>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Predicate(condition),
            label: None,
        }
    }

    /// Create an edge guarded by an expression.
    pub fn conditional(
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Expr(expr.into()),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_conditional(&self) -> bool {
        !matches!(self.condition, EdgeCondition::Always)
    }

    /// Whether the edge fires for `state`.
    pub fn matches(&self, state: &WorkflowState) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::Expr(expr) => evaluate_condition(expr, state),
            EdgeCondition::Predicate(p) => p(state),
        }
    }
}

/// Evaluate a simple conditional expression against the state.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Keys are state fields; `outputs.<node>` reads a node output. Numbers and
/// booleans compare by their JSON text. Returns `false` for unparseable
/// expressions or missing keys.
pub fn evaluate_condition(expr: &str, state: &WorkflowState) -> bool {
    let expr = expr.trim();

    // key contains "value"
    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return lookup(state, key).is_some_and(|s| s.contains(substr));
    }

    // key != "value"
    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(state, key).is_some_and(|s| s != value);
    }

    // key == "value"
    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(state, key).is_some_and(|s| s == value);
    }

    false
}

fn lookup(state: &WorkflowState, key: &str) -> Option<String> {
    let value = match key.strip_prefix("outputs.") {
        Some(node) => state.output(node),
        None => state.get(key),
    }?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Parse `key OP "value"` expressions, returning (key, value).
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let parts: Vec<&str> = expr.splitn(2, op).collect();
    if parts.len() != 2 {
        return None;
    }
    let key = parts[0].trim();
    let val = parts[1].trim().trim_matches('"');
    Some((key, val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> WorkflowState {
        let mut state = WorkflowState::new("x")
            .with_field("status", json!("success"))
            .with_field("score", json!(7))
            .with_field("summary", json!("The file was created successfully."));
        state.outputs.insert("review".into(), json!("approved"));
        state
    }

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert!(!e.is_conditional());
        assert!(e.matches(&state()));

        let e = Edge::when("a", "c", condition(|s| s.get_i64("score") == Some(7)))
            .with_label("if-true");
        assert!(e.is_conditional());
        assert_eq!(e.label.as_deref(), Some("if-true"));
        assert!(e.matches(&state()));
    }

    #[test]
    fn test_condition_equals() {
        assert!(evaluate_condition(r#"status == "success""#, &state()));
        assert!(!evaluate_condition(r#"status == "failure""#, &state()));
        assert!(evaluate_condition(r#"score == "7""#, &state()));
    }

    #[test]
    fn test_condition_not_equals() {
        assert!(evaluate_condition(r#"status != "failure""#, &state()));
        assert!(!evaluate_condition(r#"status != "success""#, &state()));
    }

    #[test]
    fn test_condition_contains() {
        assert!(evaluate_condition(r#"summary contains "created""#, &state()));
        assert!(!evaluate_condition(r#"summary contains "deleted""#, &state()));
    }

    #[test]
    fn test_condition_reads_outputs() {
        assert!(evaluate_condition(r#"outputs.review == "approved""#, &state()));
        assert!(!evaluate_condition(r#"outputs.missing == "approved""#, &state()));
    }

    #[test]
    fn test_condition_missing_key_and_invalid_expr() {
        assert!(!evaluate_condition(r#"missing == "value""#, &state()));
        assert!(!evaluate_condition("this is not valid", &state()));
    }
}
