use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::traits::{AgentSession, SessionDelta, SessionOptions};
use waypoint_core::types::{ContextAction, ContextUsage, ModelHint, NodeId, NodeKind, Signal};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult, Prompt};
use crate::nodes::OutputMapper;
use crate::retry::RetryPolicy;

/// Collected reply from one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub session_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ContextUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub input: Value,
}

/// Configuration for [`agent_node`].
#[derive(Clone)]
pub struct AgentNodeConfig {
    pub id: NodeId,
    /// Key into the runtime's session clients.
    pub agent_type: String,
    pub message: Prompt,
    pub system_prompt: Option<String>,
    pub tools: Vec<String>,
    pub model: Option<ModelHint>,
    /// Defaults to storing the reply text under `outputs[id]`.
    pub output: Option<OutputMapper<AgentReply>>,
    pub retry: Option<RetryPolicy>,
}

impl AgentNodeConfig {
    pub fn new(id: impl Into<NodeId>, agent_type: impl Into<String>, message: impl Into<Prompt>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            message: message.into(),
            system_prompt: None,
            tools: vec![],
            model: None,
            output: None,
            retry: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_model(mut self, model: ModelHint) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_output(
        mut self,
        mapper: impl Fn(AgentReply, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(mapper));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Open a session, send the resolved message, and collect the streamed reply.
///
/// The session is always closed. A reply whose usage crosses the context
/// threshold also carries a context-window warning for the host.
pub fn agent_node(config: AgentNodeConfig) -> NodeDefinition {
    let id = config.id.clone();
    let model = config.model.clone();
    let retry = config.retry.clone();
    let config = Arc::new(config);

    let mut node = NodeDefinition::new(id, NodeKind::Agent, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move { run_agent(&config, ctx).await }
    });
    node.model = model;
    node.retry = retry;
    node
}

async fn run_agent(config: &AgentNodeConfig, ctx: ExecutionContext) -> Result<NodeResult> {
    let client = ctx.runtime().session_client(&config.agent_type)?;
    let message = config.message.resolve(&ctx.state);

    let options = SessionOptions {
        agent_type: config.agent_type.clone(),
        model: ctx.model.clone(),
        system_prompt: config.system_prompt.clone(),
        tools: config.tools.clone(),
        execution_id: Some(ctx.state.execution_id.clone()),
    };
    let mut session = client.open(options).await?;
    debug!(node_id = %ctx.node_id, session_id = %session.id(), "Agent session opened");

    let collected = collect_reply(session.as_mut(), &message, &ctx).await;
    if let Err(e) = session.close().await {
        warn!(node_id = %ctx.node_id, error = %e, "Failed to close agent session");
    }
    let reply = collected?;

    let usage = reply.usage;
    let update = match &config.output {
        Some(mapper) => mapper(reply, &ctx.state),
        None => StateUpdate::new().output(ctx.node_id.clone(), Value::String(reply.text)),
    };

    let mut result = NodeResult::from_update(update);
    if let Some(usage) = usage.filter(|u| u.exceeds(ctx.context_window_threshold)) {
        result = result.signal(Signal::ContextWindowWarning {
            action: ContextAction::default_for_agent(&config.agent_type),
            usage: Some(usage),
            message: Some(format!(
                "{} context at {:.0}%",
                config.agent_type,
                usage.usage_pct()
            )),
        });
    }
    Ok(result)
}

async fn collect_reply(
    session: &mut dyn AgentSession,
    message: &str,
    ctx: &ExecutionContext,
) -> Result<AgentReply> {
    let mut reply = AgentReply {
        session_id: session.id().to_string(),
        ..AgentReply::default()
    };

    {
        let mut stream = session.send(message).await?;
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(WaypointError::Cancelled),
                item = stream.next() => item,
            };
            match next {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(SessionDelta::Text(text))) => reply.text.push_str(&text),
                Some(Ok(SessionDelta::Thinking(text))) => reply.thinking.push_str(&text),
                Some(Ok(SessionDelta::ToolUse { name, input })) => {
                    ctx.emit("tool_use", json!({"name": name, "input": input}));
                    reply.tool_uses.push(ToolUse { name, input });
                }
                Some(Ok(SessionDelta::Usage(usage))) => reply.usage = Some(usage),
            }
        }
    }

    if reply.usage.is_none() {
        reply.usage = session.usage();
    }
    Ok(reply)
}
