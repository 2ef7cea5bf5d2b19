//! Bundled demo workflow: draft, polish in a loop, review, wait for approval, publish.

use serde_json::{json, Value};

use waypoint_core::error::Result;
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_graph::nodes::{tool_node, ToolCall, ToolNodeConfig};
use waypoint_graph::{CompiledGraph, GraphBuilder, GraphConfig, NodeDefinition, WaitConfig};

/// Revisions the polish loop aims for.
const TARGET_REVISIONS: i64 = 3;
const MAX_REVISIONS: u64 = 5;

pub fn release_graph(config: GraphConfig, auto_approve: bool) -> Result<CompiledGraph> {
    GraphBuilder::new()
        .start(draft())?
        .loop_(
            vec![polish()],
            |s| s.get_i64("revision").unwrap_or(0) >= TARGET_REVISIONS,
            MAX_REVISIONS,
        )?
        .if_(|s| s.get_f64("score").unwrap_or(0.0) >= 0.8)?
        .then(verdict("approve", "ready"))?
        .else_()?
        .then(verdict("rework", "needs work"))?
        .endif()?
        .wait(
            WaitConfig::new("Publish '{{title}}' after {{revision}} revisions?")
                .auto_approve(auto_approve),
        )?
        .then(publish())?
        .end()
        .compile(config)
}

fn draft() -> NodeDefinition {
    tool_node(
        ToolNodeConfig::new("draft", |_args: Value, call: ToolCall| async move {
            let topic = call.state.get_str("topic").unwrap_or("untitled").to_string();
            Ok(json!({ "title": format!("Release notes: {topic}") }))
        })
        .with_output(|value, _state| {
            StateUpdate::new()
                .set("title", value["title"].clone())
                .set("revision", json!(0))
                .output("draft", value)
        }),
    )
}

fn polish() -> NodeDefinition {
    tool_node(
        ToolNodeConfig::new("polish", |_args: Value, call: ToolCall| async move {
            let revision = call.state.get_i64("revision").unwrap_or(0) + 1;
            Ok(json!({ "revision": revision }))
        })
        .with_output(|value, _state: &WorkflowState| {
            let revision = value["revision"].as_i64().unwrap_or(0);
            StateUpdate::new()
                .set("revision", json!(revision))
                .set("score", json!(revision as f64 * 0.3))
                .output("polish", value)
        }),
    )
}

fn verdict(id: &'static str, verdict: &'static str) -> NodeDefinition {
    tool_node(ToolNodeConfig::new(id, move |_args: Value, call: ToolCall| async move {
        Ok(json!({ "verdict": verdict, "score": call.state.get("score").cloned().unwrap_or(Value::Null) }))
    }))
}

fn publish() -> NodeDefinition {
    tool_node(ToolNodeConfig::new("publish", |_args: Value, call: ToolCall| async move {
        Ok(json!({
            "published": true,
            "title": call.state.get("title").cloned().unwrap_or(Value::Null),
        }))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::types::ExecutionStatus;
    use waypoint_graph::{ExecutionOptions, GraphExecutor};

    #[tokio::test]
    async fn test_auto_approved_demo_completes() {
        let graph = release_graph(GraphConfig::default(), true).unwrap();
        let outcome = GraphExecutor::new(graph)
            .execute(ExecutionOptions::new().with_field("topic", json!("v0.3")))
            .await;

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.state.get_i64("revision"), Some(3));
        assert!(outcome.state.has_output("approve"));
        assert!(!outcome.state.has_output("rework"));
        assert_eq!(
            outcome.state.output("publish").and_then(|p| p.get("title")),
            Some(&json!("Release notes: v0.3"))
        );
    }

    #[tokio::test]
    async fn test_demo_pauses_for_approval() {
        let graph = release_graph(GraphConfig::default(), false).unwrap();
        let outcome = GraphExecutor::new(graph).execute(ExecutionOptions::new()).await;

        assert_eq!(outcome.status, ExecutionStatus::Paused);
        assert!(outcome.snapshot.route_on_resume);
        assert!(outcome.snapshot.current_node.as_deref().is_some_and(|id| id.starts_with("wait_")));
    }
}
