//! Projection of executor steps into typed stream events.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{ExecutionStatus, NodeEvent, NodeId};

use crate::executor::StepResult;

/// Which projections a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Full state after every step.
    Values,
    /// The partial update of every step that produced one.
    Updates,
    /// Custom events emitted by nodes.
    Events,
    /// Per-step diagnostics.
    Debug,
}

impl StreamMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "values" => Some(Self::Values),
            "updates" => Some(Self::Updates),
            "events" => Some(Self::Events),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugInfo {
    pub node_id: NodeId,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    /// Attempts beyond the first.
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub state: WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StreamEvent {
    Values { state: WorkflowState },
    Updates { node_id: NodeId, update: StateUpdate },
    Events { event: NodeEvent },
    Debug { info: DebugInfo },
}

impl StreamEvent {
    pub fn mode(&self) -> StreamMode {
        match self {
            Self::Values { .. } => StreamMode::Values,
            Self::Updates { .. } => StreamMode::Updates,
            Self::Events { .. } => StreamMode::Events,
            Self::Debug { .. } => StreamMode::Debug,
        }
    }
}

/// Routes each [`StepResult`] to the enabled modes, in the order given.
#[derive(Debug, Clone)]
pub struct StreamRouter {
    modes: Vec<StreamMode>,
}

impl StreamRouter {
    pub fn new(modes: impl IntoIterator<Item = StreamMode>) -> Self {
        let mut unique = Vec::new();
        for mode in modes {
            if !unique.contains(&mode) {
                unique.push(mode);
            }
        }
        Self { modes: unique }
    }

    pub fn modes(&self) -> &[StreamMode] {
        &self.modes
    }

    pub fn route(&self, step: &StepResult) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for mode in &self.modes {
            match mode {
                StreamMode::Values => out.push(StreamEvent::Values {
                    state: step.state.clone(),
                }),
                StreamMode::Updates => {
                    if let Some(update) = &step.update {
                        out.push(StreamEvent::Updates {
                            node_id: step.node_id.clone(),
                            update: update.clone(),
                        });
                    }
                }
                StreamMode::Events => out.extend(
                    step.events
                        .iter()
                        .cloned()
                        .map(|event| StreamEvent::Events { event }),
                ),
                StreamMode::Debug => out.push(StreamEvent::Debug {
                    info: DebugInfo {
                        node_id: step.node_id.clone(),
                        status: step.status,
                        execution_time_ms: step.execution_time_ms,
                        retry_count: step.attempts.saturating_sub(1),
                        model: step.model.clone(),
                        state: step.state.clone(),
                    },
                }),
            }
        }
        out
    }
}

/// Adapt a step stream into a stream of routed events.
pub fn route_stream(
    steps: BoxStream<'static, StepResult>,
    modes: impl IntoIterator<Item = StreamMode>,
) -> BoxStream<'static, StreamEvent> {
    let router = StreamRouter::new(modes);
    steps
        .flat_map(move |step| stream::iter(router.route(&step)))
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use waypoint_core::types::ExecutionSnapshot;

    fn step(update: Option<StateUpdate>, events: Vec<NodeEvent>, attempts: u32) -> StepResult {
        let state = WorkflowState::new("exec-1").with_field("count", json!(1));
        let now = Utc::now();
        StepResult {
            node_id: "a".into(),
            status: ExecutionStatus::Running,
            state: state.clone(),
            update,
            goto: None,
            signals: vec![],
            events,
            error: None,
            attempts,
            execution_time_ms: 12,
            model: Some("sonnet".into()),
            snapshot: ExecutionSnapshot {
                execution_id: "exec-1".into(),
                state,
                status: ExecutionStatus::Running,
                current_node: Some("a".into()),
                visited_nodes: vec!["a".into()],
                errors: vec![],
                signals: vec![],
                pending_nodes: vec![],
                started_at: now,
                updated_at: now,
                node_execution_count: attempts as usize,
                step_count: 1,
                context_usage: None,
                route_on_resume: false,
            },
        }
    }

    #[test]
    fn test_updates_skipped_without_update() {
        let router = StreamRouter::new([StreamMode::Values, StreamMode::Updates]);
        let events = router.route(&step(None, vec![], 1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].mode(), StreamMode::Values);

        let update = StateUpdate::new().set("count", json!(2));
        let events = router.route(&step(Some(update.clone()), vec![], 1));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Updates {
                node_id: "a".into(),
                update
            }
        );
    }

    #[test]
    fn test_events_and_debug() {
        let router = StreamRouter::new([StreamMode::Events, StreamMode::Debug, StreamMode::Events]);
        assert_eq!(router.modes().len(), 2);

        let emitted = vec![
            NodeEvent::new("a", "progress", json!({"pct": 50})),
            NodeEvent::new("a", "progress", json!({"pct": 100})),
        ];
        let events = router.route(&step(None, emitted, 3));
        assert_eq!(events.len(), 3);
        match &events[2] {
            StreamEvent::Debug { info } => {
                assert_eq!(info.retry_count, 2);
                assert_eq!(info.execution_time_ms, 12);
                assert_eq!(info.model.as_deref(), Some("sonnet"));
            }
            other => panic!("expected debug event, got {other:?}"),
        }
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = StreamEvent::Values {
            state: WorkflowState::new("x"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["mode"], "values");
        assert_eq!(StreamMode::parse("DEBUG"), Some(StreamMode::Debug));
        assert_eq!(StreamMode::parse("nope"), None);
    }

    #[tokio::test]
    async fn test_route_stream() {
        let steps = stream::iter(vec![step(None, vec![], 1), step(None, vec![], 1)]).boxed();
        let events: Vec<_> = route_stream(steps, [StreamMode::Values]).collect().await;
        assert_eq!(events.len(), 2);
    }
}
