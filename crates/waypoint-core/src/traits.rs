use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::WorkflowState;
use crate::types::{ContextUsage, ExecutionSnapshot};

/// Options used to open an agent session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub agent_type: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub execution_id: Option<String>,
}

/// A streamed chunk of an agent reply.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionDelta {
    /// A chunk of reply text.
    Text(String),
    /// A chunk of reasoning content.
    Thinking(String),
    /// The agent invoked a tool.
    ToolUse { name: String, input: serde_json::Value },
    /// Updated context-window usage.
    Usage(ContextUsage),
}

/// Agent session client, one per agent type, injected by the host.
pub trait AgentSessionClient: Send + Sync + 'static {
    /// Open a new session.
    fn open(&self, options: SessionOptions) -> BoxFuture<'_, Result<Box<dyn AgentSession>>>;
}

/// An open conversation with an agent.
pub trait AgentSession: Send {
    /// Session identifier.
    fn id(&self) -> &str;

    /// Send a message and receive the streamed reply.
    fn send<'a>(
        &'a mut self,
        message: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<SessionDelta>>>>;

    /// Latest known context-window usage.
    fn usage(&self) -> Option<ContextUsage> {
        None
    }

    /// Ask the agent to compact its context.
    fn summarize(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Close the session.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// A request to spawn a sub-agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Unique id for this spawn (not the graph node id).
    pub agent_id: String,
    /// Registered sub-agent type.
    pub agent_name: String,
    pub task: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

/// The result of a sub-agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentOutcome {
    pub agent_id: String,
    pub agent_name: String,
    pub success: bool,
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tool_uses: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

impl SubAgentOutcome {
    pub fn success(request: &SpawnRequest, output: impl Into<String>) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            agent_name: request.agent_name.clone(),
            success: true,
            output: output.into(),
            error: None,
            tool_uses: 0,
            duration_ms: 0,
        }
    }

    pub fn failure(request: &SpawnRequest, error: impl Into<String>) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            agent_name: request.agent_name.clone(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            tool_uses: 0,
            duration_ms: 0,
        }
    }
}

/// Bridge for spawning sub-agents without depending on a concrete runtime.
pub trait SubAgentBridge: Send + Sync + 'static {
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<SubAgentOutcome>>;

    /// Spawn several sub-agents concurrently. A spawn that errors is reported
    /// as a failed outcome rather than failing the whole batch.
    fn spawn_parallel(
        &self,
        requests: Vec<SpawnRequest>,
    ) -> BoxFuture<'_, Result<Vec<SubAgentOutcome>>> {
        Box::pin(async move {
            let spawns = requests.into_iter().map(|request| async move {
                match self.spawn(request.clone()).await {
                    Ok(outcome) => outcome,
                    Err(e) => SubAgentOutcome::failure(&request, e.to_string()),
                }
            });
            Ok(futures::future::join_all(spawns).await)
        })
    }
}

/// A registered sub-agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl SubAgentEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            system_prompt: None,
            model: None,
            tools: vec![],
        }
    }
}

/// Registry of sub-agent types.
pub trait SubAgentRegistry: Send + Sync + 'static {
    fn get(&self, name: &str) -> Option<SubAgentEntry>;
}

impl SubAgentRegistry for HashMap<String, SubAgentEntry> {
    fn get(&self, name: &str) -> Option<SubAgentEntry> {
        HashMap::get(self, name).cloned()
    }
}

/// Custom tool invoked by custom-tool nodes.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (registry key).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool against a frozen snapshot of the workflow state.
    fn execute(
        &self,
        input: serde_json::Value,
        state: Arc<WorkflowState>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;
}

/// Checkpoint persistence backend.
///
/// Only `save` is driven by the executor; loading and resuming is up to the host.
pub trait CheckpointSink: Send + Sync + 'static {
    /// Persist a snapshot under an optional label.
    fn save<'a>(
        &'a self,
        execution_id: &'a str,
        snapshot: &'a ExecutionSnapshot,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    /// Load the snapshot saved under `label`, or the most recent one.
    fn load<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ExecutionSnapshot>>>;

    /// Labels saved for an execution, oldest first.
    fn list<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Delete one labelled checkpoint, or all of them. Returns how many were removed.
    fn delete<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<usize>>;
}
