use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use waypoint_core::error::WaypointError;
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{ExecutionStatus, NodeId, NodeKind};

use crate::compiled::CompiledGraph;
use crate::executor::{ExecutionOptions, GraphExecutor};
use crate::node::{ExecutionContext, NodeDefinition, NodeResult};
use crate::state::init_state;

/// Where a subgraph node gets its child workflow.
#[derive(Clone)]
pub enum SubgraphSource {
    Graph(Arc<CompiledGraph>),
    /// Looked up through the runtime's workflow resolver.
    Named(String),
}

impl SubgraphSource {
    fn label(&self) -> &str {
        match self {
            Self::Graph(_) => "inline",
            Self::Named(name) => name,
        }
    }
}

type InputMapper = Arc<dyn Fn(&WorkflowState) -> Map<String, Value> + Send + Sync>;
type OutputMapper = Arc<dyn Fn(&WorkflowState, &WorkflowState) -> StateUpdate + Send + Sync>;

/// Configuration for [`subgraph_node`].
#[derive(Clone)]
pub struct SubgraphConfig {
    pub id: NodeId,
    pub source: SubgraphSource,
    /// Child fields from the parent state. Defaults to a copy of the parent fields.
    pub input: Option<InputMapper>,
    /// Parent update from (child, parent). Defaults to
    /// `outputs[id] = { outputs, fields }` of the child.
    pub output: Option<OutputMapper>,
}

impl SubgraphConfig {
    pub fn new(id: impl Into<NodeId>, source: SubgraphSource) -> Self {
        Self {
            id: id.into(),
            source,
            input: None,
            output: None,
        }
    }

    pub fn graph(id: impl Into<NodeId>, graph: Arc<CompiledGraph>) -> Self {
        Self::new(id, SubgraphSource::Graph(graph))
    }

    pub fn named(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self::new(id, SubgraphSource::Named(name.into()))
    }

    pub fn with_input(
        mut self,
        f: impl Fn(&WorkflowState) -> Map<String, Value> + Send + Sync + 'static,
    ) -> Self {
        self.input = Some(Arc::new(f));
        self
    }

    pub fn with_output(
        mut self,
        f: impl Fn(&WorkflowState, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(f));
        self
    }
}

/// Run a child workflow to completion inside this node.
///
/// The child shares the parent's cancellation and runtime, and inherits its
/// resolved model. Anything other than a completed child fails the node.
pub fn subgraph_node(config: SubgraphConfig) -> NodeDefinition {
    let id = config.id.clone();
    let config = Arc::new(config);

    NodeDefinition::new(id, NodeKind::Subgraph, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let graph = match &config.source {
                SubgraphSource::Graph(graph) => Arc::clone(graph),
                SubgraphSource::Named(name) => ctx.runtime().workflow(name)?,
            };

            let fields = match &config.input {
                Some(f) => f(&ctx.state),
                None => ctx.state.fields.clone(),
            };
            let child_id = format!("{}:{}", ctx.state.execution_id, ctx.node_id);
            let child = init_state(Some(child_id), fields);

            info!(node_id = %ctx.node_id, workflow = %config.source.label(), "Running subgraph");
            let mut options = ExecutionOptions::new()
                .with_state(child)
                .with_cancel(ctx.cancel.child_token())
                .with_runtime(ctx.runtime().clone());
            if let Some(model) = &ctx.model {
                options = options.with_parent_model(model.clone());
            }

            let outcome = GraphExecutor::new(graph).execute(options).await;
            debug!(node_id = %ctx.node_id, status = %outcome.status, "Subgraph finished");

            match outcome.status {
                ExecutionStatus::Completed => {}
                ExecutionStatus::Cancelled => return Err(WaypointError::Cancelled),
                status => {
                    let reason = outcome
                        .error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "no error recorded".to_string());
                    return Err(WaypointError::Subgraph(format!(
                        "'{}' ended {status}: {reason}",
                        config.source.label()
                    )));
                }
            }

            let update = match &config.output {
                Some(f) => f(&outcome.state, &ctx.state),
                None => StateUpdate::new().output(
                    ctx.node_id.clone(),
                    json!({ "outputs": outcome.state.outputs, "fields": outcome.state.fields }),
                ),
            };
            Ok(NodeResult::from_update(update))
        }
    })
}
