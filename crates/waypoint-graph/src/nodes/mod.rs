//! Factories for the built-in node kinds.
//!
//! Each factory takes a config struct and returns a [`NodeDefinition`] whose
//! body talks to the host only through [`RuntimeDeps`](crate::runtime::RuntimeDeps).

pub mod agent;
pub mod context_monitor;
pub mod decision;
pub mod parallel;
pub mod subagent;
pub mod subgraph;
pub mod tool;
pub mod wait;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::WorkflowState;

pub use agent::{agent_node, AgentNodeConfig, AgentReply, ToolUse};
pub use context_monitor::{context_monitor_node, ContextMonitorConfig};
pub use decision::{decision_node, DecisionConfig};
pub use parallel::{parallel_node, ParallelCombiner, ParallelConfig};
pub use subagent::{
    collect_outputs, parallel_subagent_node, subagent_node, ParallelSubagentConfig,
    SubagentCombiner, SubagentConfig, SubagentTask,
};
pub use subgraph::{subgraph_node, SubgraphConfig, SubgraphSource};
pub use tool::{
    clear_context_node, custom_tool_node, tool_node, CustomToolConfig, ToolCall, ToolFn,
    ToolNodeConfig,
};
pub use wait::{ask_user_node, wait_node, AskUserConfig, AskUserOptions, WaitConfig};

/// Set while a wait or ask-user node is paused.
pub const WAITING_FOR_INPUT: &str = "__waiting_for_input";
/// Id of the node that paused.
pub const WAIT_NODE_ID: &str = "__wait_node_id";
/// Request id of the pending ask-user question.
pub const ASK_USER_REQUEST_ID: &str = "__ask_user_request_id";

/// Maps a raw result plus the current state to a state update.
pub type OutputMapper<T> = Arc<dyn Fn(T, &WorkflowState) -> waypoint_core::StateUpdate + Send + Sync>;

/// Tool arguments, fixed or derived from state.
#[derive(Clone)]
pub enum ToolArgs {
    Static(Value),
    Derived(Arc<dyn Fn(&WorkflowState) -> Value + Send + Sync>),
}

impl ToolArgs {
    pub fn derived(f: impl Fn(&WorkflowState) -> Value + Send + Sync + 'static) -> Self {
        Self::Derived(Arc::new(f))
    }

    pub fn resolve(&self, state: &WorkflowState) -> Value {
        match self {
            Self::Static(v) => v.clone(),
            Self::Derived(f) => f(state),
        }
    }
}

impl Default for ToolArgs {
    fn default() -> Self {
        Self::Static(Value::Object(Default::default()))
    }
}

impl From<Value> for ToolArgs {
    fn from(v: Value) -> Self {
        Self::Static(v)
    }
}

impl fmt::Debug for ToolArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Run `fut` until it finishes, `token` is cancelled, or `timeout` elapses.
///
/// On timeout the token is cancelled so cooperative work can stop early.
pub(crate) async fn run_guarded<T, F>(
    fut: F,
    timeout: Option<Duration>,
    token: &CancellationToken,
    operation: &str,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guarded = async {
        tokio::select! {
            _ = token.cancelled() => Err(WaypointError::Cancelled),
            result = fut => result,
        }
    };
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                Err(WaypointError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        },
        None => guarded.await,
    }
}
