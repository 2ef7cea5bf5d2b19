use std::sync::Arc;

use serde_json::{json, Value};

use waypoint_core::state::StateUpdate;
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::{ExecutionStatus, NodeKind};
use waypoint_graph::{
    CompiledGraph, ExecutionContext, ExecutionOptions, GraphBuilder, GraphConfig, GraphExecutor,
    NodeDefinition, NodeResult, SqliteCheckpointSink, WaitConfig,
};

fn output(id: &str, value: Value) -> NodeDefinition {
    NodeDefinition::new(id, NodeKind::Tool, move |ctx: ExecutionContext| {
        let value = value.clone();
        async move {
            Ok(NodeResult::from_update(
                StateUpdate::new().output(ctx.node_id.clone(), value),
            ))
        }
    })
}

fn approval_graph(sink: Arc<SqliteCheckpointSink>) -> CompiledGraph {
    GraphBuilder::new()
        .start(output("draft", json!("v1")))
        .unwrap()
        .wait(WaitConfig::new("Ship it?"))
        .unwrap()
        .then(output("ship", json!("shipped")))
        .unwrap()
        .compile(GraphConfig::default().with_checkpointer(sink))
        .unwrap()
}

#[tokio::test]
async fn test_resume_after_reopening_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("checkpoints.db");

    {
        let sink = Arc::new(SqliteCheckpointSink::open(&db).unwrap());
        let outcome = GraphExecutor::new(approval_graph(sink))
            .execute(ExecutionOptions::new().with_execution_id("exec-ship"))
            .await;
        assert_eq!(outcome.status, ExecutionStatus::Paused);
    }

    // A fresh handle, as a restarted host would open it
    let sink = Arc::new(SqliteCheckpointSink::open(&db).unwrap());
    assert_eq!(sink.executions().unwrap(), vec!["exec-ship"]);
    let snapshot = sink.load("exec-ship", None).await.unwrap().unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Paused);

    let outcome = GraphExecutor::new(approval_graph(sink.clone()))
        .execute(ExecutionOptions::resume(snapshot).with_resume_input(json!("yes")))
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.execution_id, "exec-ship");
    assert_eq!(outcome.state.output("ship"), Some(&json!("shipped")));
    assert_eq!(outcome.state.output("draft"), Some(&json!("v1")));
}

#[tokio::test]
async fn test_delete_clears_execution() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(SqliteCheckpointSink::open(&dir.path().join("cp.db")).unwrap());
    GraphExecutor::new(approval_graph(sink.clone()))
        .execute(ExecutionOptions::new().with_execution_id("exec-drop"))
        .await;

    assert_eq!(sink.list("exec-drop").await.unwrap().len(), 1);
    assert_eq!(sink.delete("exec-drop", None).await.unwrap(), 1);
    assert!(sink.load("exec-drop", None).await.unwrap().is_none());
    assert!(sink.executions().unwrap().is_empty());
}
