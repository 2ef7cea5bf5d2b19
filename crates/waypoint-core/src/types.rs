use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::WorkflowState;

/// Unique node identifier within a compiled graph.
pub type NodeId = String;

/// Create a fresh execution id.
pub fn new_execution_id() -> String {
    Uuid::new_v4().to_string()
}

/// Type tag carried by every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Tool,
    Decision,
    Wait,
    AskUser,
    Subgraph,
    Parallel,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Decision => "decision",
            Self::Wait => "wait",
            Self::AskUser => "ask_user",
            Self::Subgraph => "subgraph",
            Self::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

/// Model selection for a node or a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelHint {
    /// Use whatever the surrounding context resolved.
    Inherit,
    /// Use this model.
    Explicit(String),
}

impl ModelHint {
    /// Parse the config form: the literal `"inherit"` or a model name.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("inherit") {
            Self::Inherit
        } else {
            Self::Explicit(s.to_string())
        }
    }

    pub fn explicit(&self) -> Option<&str> {
        match self {
            Self::Inherit => None,
            Self::Explicit(m) => Some(m.as_str()),
        }
    }
}

/// Execution status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Statuses after which the stream stops.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What a context-window warning asks the host (or executor) to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextAction {
    Summarize,
    Recreate,
    Warn,
    None,
}

impl ContextAction {
    /// Default breach action for an agent type.
    pub fn default_for_agent(agent_type: &str) -> Self {
        match agent_type {
            "claude" | "opencode" => Self::Summarize,
            "copilot" => Self::Recreate,
            _ => Self::Warn,
        }
    }
}

/// Context-window usage of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub max_tokens: u64,
}

impl ContextUsage {
    pub fn new(input_tokens: u64, output_tokens: u64, max_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            max_tokens,
        }
    }

    /// Usage as a percentage of the window (0 when the window is unknown).
    pub fn usage_pct(&self) -> f64 {
        if self.max_tokens == 0 {
            return 0.0;
        }
        (self.input_tokens + self.output_tokens) as f64 / self.max_tokens as f64 * 100.0
    }

    pub fn exceeds(&self, threshold_pct: f64) -> bool {
        self.usage_pct() >= threshold_pct
    }
}

/// A structured option offered by an ask-user node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskUserOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AskUserOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Side-channel instruction returned by a node alongside its state update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Stop traversal and wait for host-supplied input.
    PauseForInput {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<AskUserOption>,
    },
    /// Persist a checkpoint now.
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    /// The context window is close to full.
    ContextWindowWarning {
        action: ContextAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<ContextUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Signal {
    pub fn pause(prompt: impl Into<String>) -> Self {
        Self::PauseForInput {
            prompt: prompt.into(),
            request_id: None,
            options: Vec::new(),
        }
    }

    pub fn checkpoint(label: Option<String>) -> Self {
        Self::Checkpoint { label }
    }

    pub fn context_warning(action: ContextAction, usage: Option<ContextUsage>) -> Self {
        Self::ContextWindowWarning {
            action,
            usage,
            message: None,
        }
    }

    pub fn is_pause(&self) -> bool {
        matches!(self, Self::PauseForInput { .. })
    }
}

/// Fan-out merge strategy recorded for a parallel node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    All,
    Race,
    Any,
}

/// An error recorded in the execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub node_id: NodeId,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(node_id: impl Into<NodeId>, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
            attempt,
            timestamp: Utc::now(),
        }
    }
}

/// A custom event emitted by a node while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: NodeId,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(node_id: impl Into<NodeId>, name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            node_id: node_id.into(),
            name: name.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Everything needed to resume an execution exactly where it stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub state: WorkflowState,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_node: Option<NodeId>,
    #[serde(default)]
    pub visited_nodes: Vec<NodeId>,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub signals: Vec<Signal>,
    /// Node ids still waiting to run, in order.
    #[serde(default)]
    pub pending_nodes: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub node_execution_count: usize,
    #[serde(default)]
    pub step_count: usize,
    #[serde(default)]
    pub context_usage: Option<ContextUsage>,
    /// Successors of `current_node` are resolved on resume, against the
    /// state with the resume input merged.
    #[serde(default)]
    pub route_on_resume: bool,
}

impl ExecutionSnapshot {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_hint_parse() {
        assert_eq!(ModelHint::parse("inherit"), ModelHint::Inherit);
        assert_eq!(ModelHint::parse("INHERIT"), ModelHint::Inherit);
        assert_eq!(
            ModelHint::parse("sonnet").explicit(),
            Some("sonnet")
        );
        assert_eq!(ModelHint::Inherit.explicit(), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(ExecutionStatus::Paused.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert_eq!(ExecutionStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_context_usage_pct() {
        let usage = ContextUsage::new(60_000, 20_000, 100_000);
        assert!((usage.usage_pct() - 80.0).abs() < f64::EPSILON);
        assert!(usage.exceeds(80.0));
        assert!(!usage.exceeds(90.0));
        assert_eq!(ContextUsage::default().usage_pct(), 0.0);
    }

    #[test]
    fn test_default_context_action() {
        assert_eq!(ContextAction::default_for_agent("claude"), ContextAction::Summarize);
        assert_eq!(ContextAction::default_for_agent("opencode"), ContextAction::Summarize);
        assert_eq!(ContextAction::default_for_agent("copilot"), ContextAction::Recreate);
        assert_eq!(ContextAction::default_for_agent("custom"), ContextAction::Warn);
    }

    #[test]
    fn test_signal_serialization() {
        let signal = Signal::pause("Approve?");
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "pause_for_input");
        assert_eq!(json["prompt"], "Approve?");
        assert!(signal.is_pause());

        let parsed: Signal = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, signal);
    }
}
