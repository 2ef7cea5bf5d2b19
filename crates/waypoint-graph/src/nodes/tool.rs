use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{ContextAction, NodeId, NodeKind, Signal};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult};
use crate::nodes::{run_guarded, OutputMapper, ToolArgs};
use crate::retry::RetryPolicy;
use crate::schema;

/// What an inline tool function receives besides its arguments.
#[derive(Clone)]
pub struct ToolCall {
    pub node_id: NodeId,
    pub state: Arc<WorkflowState>,
    /// Cancelled when the run is cancelled or the node times out.
    pub cancel: CancellationToken,
}

pub type ToolFn = Arc<dyn Fn(Value, ToolCall) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Configuration for [`tool_node`].
#[derive(Clone)]
pub struct ToolNodeConfig {
    pub id: NodeId,
    pub name: Option<String>,
    pub execute: ToolFn,
    pub args: ToolArgs,
    /// Defaults to storing the return value under `outputs[id]`.
    pub output: Option<OutputMapper<Value>>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl ToolNodeConfig {
    pub fn new<F, Fut>(id: impl Into<NodeId>, execute: F) -> Self
    where
        F: Fn(Value, ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            name: None,
            execute: Arc::new(move |args, call| -> BoxFuture<'static, Result<Value>> {
                Box::pin(execute(args, call))
            }),
            args: ToolArgs::default(),
            output: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_args(mut self, args: impl Into<ToolArgs>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_output(
        mut self,
        mapper: impl Fn(Value, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(mapper));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Run an inline async function as a node.
pub fn tool_node(config: ToolNodeConfig) -> NodeDefinition {
    let id = config.id.clone();
    let name = config.name.clone();
    let retry = config.retry.clone();
    let config = Arc::new(config);

    let mut node = NodeDefinition::new(id, NodeKind::Tool, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let args = config.args.resolve(&ctx.state);
            let token = ctx.cancel.child_token();
            let call = ToolCall {
                node_id: ctx.node_id.clone(),
                state: Arc::new(ctx.state.clone()),
                cancel: token.clone(),
            };
            let operation = format!("tool node '{}'", ctx.node_id);
            let value = run_guarded((config.execute)(args, call), config.timeout, &token, &operation).await?;
            Ok(NodeResult::from_update(map_output(&config.output, &ctx, value)))
        }
    });
    node.name = name;
    node.retry = retry;
    node
}

/// Ask the host to compact the agent's context.
pub fn clear_context_node(id: impl Into<NodeId>, message: Option<String>) -> NodeDefinition {
    NodeDefinition::new(id, NodeKind::Tool, move |ctx: ExecutionContext| {
        let message = message.clone();
        async move {
            debug!(node_id = %ctx.node_id, "Requesting context summarization");
            Ok(NodeResult::new().signal(Signal::ContextWindowWarning {
                action: ContextAction::Summarize,
                usage: ctx.context_usage,
                message,
            }))
        }
    })
}

/// Configuration for [`custom_tool_node`].
#[derive(Clone)]
pub struct CustomToolConfig {
    pub id: NodeId,
    /// Registered tool name.
    pub tool: String,
    pub args: ToolArgs,
    pub output: Option<OutputMapper<Value>>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl CustomToolConfig {
    pub fn new(id: impl Into<NodeId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            args: ToolArgs::default(),
            output: None,
            timeout: None,
            retry: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<ToolArgs>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_output(
        mut self,
        mapper: impl Fn(Value, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(mapper));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Look a tool up in the runtime registry, validate its input, and run it.
pub fn custom_tool_node(config: CustomToolConfig) -> NodeDefinition {
    let id = config.id.clone();
    let name = config.tool.clone();
    let retry = config.retry.clone();
    let config = Arc::new(config);

    let mut node = NodeDefinition::new(id, NodeKind::Tool, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let registry = ctx.runtime().tool_registry(&config.tool)?;
            let tool = registry
                .get(&config.tool)
                .ok_or_else(|| WaypointError::ToolNotFound(config.tool.clone()))?;

            let args = config.args.resolve(&ctx.state);
            schema::validate(&tool.input_schema(), &args, &format!("tool '{}' input", config.tool))?;

            let token = ctx.cancel.child_token();
            let state = Arc::new(ctx.state.clone());
            let operation = format!("tool '{}'", config.tool);
            let value = run_guarded(tool.execute(args, state), config.timeout, &token, &operation).await?;
            Ok(NodeResult::from_update(map_output(&config.output, &ctx, value)))
        }
    });
    node.name = Some(name);
    node.retry = retry;
    node
}

fn map_output(mapper: &Option<OutputMapper<Value>>, ctx: &ExecutionContext, value: Value) -> StateUpdate {
    match mapper {
        Some(mapper) => mapper(value, &ctx.state),
        None => StateUpdate::new().output(ctx.node_id.clone(), value),
    }
}
