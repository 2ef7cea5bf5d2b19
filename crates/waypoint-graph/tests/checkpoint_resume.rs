use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use waypoint_core::event::ProgressKind;
use waypoint_core::state::StateUpdate;
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::{AskUserOption, ExecutionSnapshot, ExecutionStatus, NodeKind, Signal};
use waypoint_graph::nodes::{
    ask_user_node, wait_node, AskUserConfig, WaitConfig, ASK_USER_REQUEST_ID, WAITING_FOR_INPUT,
    WAIT_NODE_ID,
};
use waypoint_graph::{
    ExecutionContext, ExecutionOptions, GraphBuilder, GraphConfig, GraphExecutor,
    MemoryCheckpointSink, NodeDefinition, NodeResult, RetryPolicy,
};
use waypoint_test_utils::{FailingCheckpointSink, RecordingProgress};

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

fn approval_graph(config: GraphConfig) -> GraphExecutor {
    let graph = GraphBuilder::new()
        .start(output("draft", json!("v1")))
        .unwrap()
        .wait(WaitConfig::new("Publish {{outputs.draft}}?"))
        .unwrap()
        .then(output("publish", json!("published")))
        .unwrap()
        .compile(config)
        .unwrap();
    GraphExecutor::new(graph)
}

#[tokio::test]
async fn test_pause_serialize_resume() {
    let sink = Arc::new(MemoryCheckpointSink::new());
    let executor = approval_graph(
        GraphConfig::default()
            .with_retry(RetryPolicy::none())
            .with_checkpointer(sink.clone()),
    );

    let steps: Vec<_> = executor
        .stream(ExecutionOptions::new().with_execution_id("exec-pause"))
        .collect()
        .await;
    let paused = steps.last().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert!(matches!(&paused.signals[0], Signal::PauseForInput { prompt, .. } if prompt == "Publish v1?"));
    assert_eq!(paused.state.get(WAITING_FOR_INPUT), Some(&json!(true)));
    assert!(!paused.state.has_output("publish"));

    let wait_id = paused.node_id.clone();
    assert_eq!(paused.state.get(WAIT_NODE_ID), Some(&Value::String(wait_id.clone())));

    let saved = sink.load("exec-pause", None).await.unwrap().unwrap();
    assert_eq!(saved.status, ExecutionStatus::Paused);
    assert!(saved.pending_nodes.is_empty());
    assert!(saved.route_on_resume);
    assert_eq!(saved.current_node.as_deref(), Some(wait_id.as_str()));

    let restored = ExecutionSnapshot::from_json(&saved.to_json().unwrap()).unwrap();
    let outcome = executor
        .execute(ExecutionOptions::resume(restored).with_resume_input(json!("approved")))
        .await;

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.execution_id, "exec-pause");
    assert_eq!(outcome.path, vec!["publish"]);
    assert_eq!(outcome.state.output(&wait_id), Some(&json!("approved")));
    assert_eq!(outcome.state.get(WAITING_FOR_INPUT), Some(&json!(false)));
    assert_eq!(outcome.state.output("draft"), Some(&json!("v1")));
    assert_eq!(outcome.snapshot.visited_nodes, vec!["draft".to_string(), wait_id, "publish".to_string()]);
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_outputs() {
    let executor = approval_graph(GraphConfig::default().with_retry(RetryPolicy::none()));
    let paused = executor.execute(ExecutionOptions::new()).await;
    assert_eq!(paused.status, ExecutionStatus::Paused);
    let resumed = executor
        .execute(ExecutionOptions::resume(paused.snapshot).with_resume_input(json!("ok")))
        .await;

    // Same graph with the wait answered up front
    let graph = GraphBuilder::new()
        .start(output("draft", json!("v1")))
        .unwrap()
        .then(output("wait_1", json!("ok")))
        .unwrap()
        .then(output("publish", json!("published")))
        .unwrap()
        .compile(GraphConfig::default())
        .unwrap();
    let straight = GraphExecutor::new(graph).execute(ExecutionOptions::new()).await;

    assert_eq!(resumed.state.outputs, straight.state.outputs);
}

#[tokio::test]
async fn test_auto_approved_wait_is_skipped() {
    let graph = GraphBuilder::new()
        .start(output("draft", json!("v1")))
        .unwrap()
        .wait(WaitConfig::new("ok?").auto_approve(true))
        .unwrap()
        .then(output("publish", json!("published")))
        .unwrap()
        .compile(GraphConfig::default())
        .unwrap();

    let outcome = GraphExecutor::new(graph).execute(ExecutionOptions::new()).await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.path, vec!["draft", "publish"]);
}

#[tokio::test]
async fn test_ask_user_round_trip() {
    let ask = ask_user_node(
        AskUserConfig::new("target", "Deploy where?")
            .with_options(vec![AskUserOption::new("staging"), AskUserOption::new("prod")]),
    );
    let graph = GraphBuilder::new()
        .start(ask)
        .unwrap()
        .then(output("deploy", json!(true)))
        .unwrap()
        .compile(GraphConfig::default())
        .unwrap();
    let executor = GraphExecutor::new(graph);

    let mut stream = executor.stream(ExecutionOptions::new());
    let step = stream.next().await.unwrap();
    assert_eq!(step.status, ExecutionStatus::Paused);
    assert_eq!(step.events[0].name, "human_input_required");
    let request_id = step.state.get_str(ASK_USER_REQUEST_ID).unwrap().to_string();
    match &step.signals[0] {
        Signal::PauseForInput { request_id: id, options, .. } => {
            assert_eq!(id.as_deref(), Some(request_id.as_str()));
            assert_eq!(options.len(), 2);
        }
        other => panic!("unexpected signal {other:?}"),
    }
    drop(stream);

    let outcome = executor
        .execute(ExecutionOptions::resume(step.snapshot).with_resume_input(json!("prod")))
        .await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(
        outcome.state.output("target"),
        Some(&json!({"answer": "prod", "request_id": request_id}))
    );
    assert_eq!(outcome.state.get(ASK_USER_REQUEST_ID), Some(&Value::Null));
}

#[tokio::test]
async fn test_checkpoint_signal_and_auto_checkpoint() {
    let sink = Arc::new(MemoryCheckpointSink::new());
    let progress = RecordingProgress::new();
    let marker = NodeDefinition::new("marker", NodeKind::Tool, |_ctx: ExecutionContext| async {
        Ok(NodeResult::new().signal(Signal::checkpoint(Some("after-marker".into()))))
    });
    let graph = GraphBuilder::new()
        .start(output("a", json!(1)))
        .unwrap()
        .then(marker)
        .unwrap()
        .compile(
            GraphConfig::default()
                .with_checkpointer(sink.clone())
                .with_auto_checkpoint(true)
                .with_progress(progress.callback()),
        )
        .unwrap();

    let outcome = GraphExecutor::new(graph)
        .execute(ExecutionOptions::new().with_execution_id("exec-cp"))
        .await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);

    let labels = sink.list("exec-cp").await.unwrap();
    assert_eq!(labels, vec!["step-1", "after-marker", "step-2"]);
    let latest = sink.load("exec-cp", None).await.unwrap().unwrap();
    assert_eq!(latest.status, ExecutionStatus::Completed);
    assert_eq!(progress.count(ProgressKind::CheckpointSaved), 3);
}

#[tokio::test]
async fn test_failing_sink_does_not_block() {
    let sink = Arc::new(FailingCheckpointSink::new());
    let graph = GraphBuilder::new()
        .start(output("a", json!(1)))
        .unwrap()
        .then(output("b", json!(2)))
        .unwrap()
        .compile(
            GraphConfig::default()
                .with_checkpointer(sink.clone())
                .with_auto_checkpoint(true),
        )
        .unwrap();

    let outcome = GraphExecutor::new(graph).execute(ExecutionOptions::new()).await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(sink.attempts(), 2);
}

#[tokio::test]
async fn test_resume_from_running_snapshot() {
    let graph = GraphBuilder::new()
        .start(output("a", json!(1)))
        .unwrap()
        .then(output("b", json!(2)))
        .unwrap()
        .then(output("c", json!(3)))
        .unwrap()
        .compile(GraphConfig::default())
        .unwrap();
    let executor = GraphExecutor::new(graph);

    let mut stream = executor.stream(ExecutionOptions::new());
    let first = stream.next().await.unwrap();
    drop(stream);
    assert_eq!(first.status, ExecutionStatus::Running);
    assert_eq!(first.snapshot.pending_nodes, vec!["b"]);

    let outcome = executor.execute(ExecutionOptions::resume(first.snapshot)).await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.path, vec!["b", "c"]);
    assert_eq!(outcome.snapshot.step_count, 3);
}

fn approval_fork() -> GraphExecutor {
    let graph = GraphBuilder::new()
        .start(output("draft", json!("v1")))
        .unwrap()
        .then(wait_node("approve", WaitConfig::new("Approve?")))
        .unwrap()
        .add_node(output("publish", json!("p")))
        .unwrap()
        .add_node(output("reject", json!("r")))
        .unwrap()
        .conditional_edge("approve", "publish", |s| s.output("approve") == Some(&json!("yes")))
        .conditional_edge("approve", "reject", |s| s.output("approve") != Some(&json!("yes")))
        .compile(GraphConfig::default())
        .unwrap();
    GraphExecutor::new(graph)
}

#[tokio::test]
async fn test_resume_input_drives_routing() {
    let executor = approval_fork();
    let paused = executor.execute(ExecutionOptions::new()).await;
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert!(paused.snapshot.pending_nodes.is_empty());

    let restored = ExecutionSnapshot::from_json(&paused.snapshot.to_json().unwrap()).unwrap();
    let approved = executor
        .execute(ExecutionOptions::resume(restored).with_resume_input(json!("yes")))
        .await;
    assert_eq!(approved.status, ExecutionStatus::Completed);
    assert_eq!(approved.path, vec!["publish"]);
    assert!(!approved.state.has_output("reject"));

    let declined = executor
        .execute(ExecutionOptions::resume(paused.snapshot).with_resume_input(json!("no")))
        .await;
    assert_eq!(declined.path, vec!["reject"]);
    assert!(!declined.state.has_output("publish"));
}

#[tokio::test]
async fn test_reserved_field_update_keeps_snapshot_loadable() {
    let sink = Arc::new(MemoryCheckpointSink::new());
    let stamp = NodeDefinition::new("stamp", NodeKind::Tool, |_ctx: ExecutionContext| async {
        Ok(NodeResult::from_update(
            StateUpdate::new()
                .set("last_updated", json!("yesterday"))
                .set("note", json!("kept")),
        ))
    });
    let graph = GraphBuilder::new()
        .start(stamp)
        .unwrap()
        .wait(WaitConfig::new("continue?"))
        .unwrap()
        .then(output("done", json!(true)))
        .unwrap()
        .compile(GraphConfig::default().with_checkpointer(sink.clone()))
        .unwrap();
    let executor = GraphExecutor::new(graph);

    let paused = executor
        .execute(ExecutionOptions::new().with_execution_id("exec-reserved"))
        .await;
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(paused.state.get_str("note"), Some("kept"));
    assert!(paused.state.get("last_updated").is_none());

    let json = paused.snapshot.to_json().unwrap();
    let restored = ExecutionSnapshot::from_json(&json).unwrap();
    assert_eq!(restored.state, paused.state);

    let saved = sink.load("exec-reserved", None).await.unwrap().unwrap();
    let outcome = executor.execute(ExecutionOptions::resume(saved)).await;
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert!(outcome.state.has_output("done"));
}
