use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::WorkflowState;
use crate::types::NodeId;

/// Progress notification kinds delivered to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    NodeStarted,
    NodeCompleted,
    NodeError,
    CheckpointSaved,
}

/// A fire-and-forget progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub node_id: NodeId,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, node_id: impl Into<NodeId>, state: &WorkflowState) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            state: state.clone(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Host callback receiving progress events.
pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Progress fan-out over a tokio broadcast channel.
/// All subscribers receive all events.
pub struct ProgressBus {
    tx: tokio::sync::broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ProgressEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// A progress callback that publishes into this bus.
    pub fn callback(self: &Arc<Self>) -> ProgressCallback {
        let bus = Arc::clone(self);
        Arc::new(move |event| bus.publish(event))
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bus_callback_delivers() {
        let bus = Arc::new(ProgressBus::default());
        let mut rx = bus.subscribe();
        let callback = bus.callback();

        let state = WorkflowState::new("exec");
        callback(ProgressEvent::new(ProgressKind::NodeStarted, "a", &state));
        callback(ProgressEvent::new(ProgressKind::NodeError, "a", &state).with_error("boom"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, ProgressKind::NodeStarted);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ProgressBus::new(4);
        bus.publish(ProgressEvent::new(
            ProgressKind::CheckpointSaved,
            "n",
            &WorkflowState::new("e"),
        ));
    }
}
