use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use waypoint_core::error::Result;
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{
    ContextUsage, ExecutionError, ModelHint, NodeEvent, NodeId, NodeKind, Signal,
};

use crate::config::GraphConfig;
use crate::retry::{ErrorAction, ErrorHandler, RetryPolicy};
use crate::runtime::RuntimeDeps;

/// The async body of a node.
pub type ExecuteFn = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<NodeResult>> + Send + Sync>;

/// Turns host-supplied resume input into a state update for a paused node.
pub type ResumeMapper = Arc<dyn Fn(Value, &WorkflowState) -> StateUpdate + Send + Sync>;

/// What a node hands back to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<StateUpdate>,
    /// Explicit successors. Overrides edge evaluation when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<Signal>,
}

impl NodeResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_update(update: StateUpdate) -> Self {
        Self {
            update: Some(update),
            ..Self::default()
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = Some(match self.update.take() {
            Some(existing) => existing.extend(update),
            None => update,
        });
        self
    }

    pub fn goto(mut self, target: impl Into<NodeId>) -> Self {
        self.goto.get_or_insert_with(Vec::new).push(target.into());
        self
    }

    pub fn goto_all(mut self, targets: Vec<NodeId>) -> Self {
        self.goto = Some(targets);
        self
    }

    pub fn signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }
}

/// Sends custom events from a running node to the step being built.
#[derive(Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<NodeEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: NodeEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means the step was already reported
            let _ = tx.send(event);
        }
    }
}

/// Everything a node can see while it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    pub node_id: NodeId,
    /// Snapshot of the state at node entry.
    pub state: WorkflowState,
    pub config: Arc<GraphConfig>,
    /// Errors recorded so far in this run.
    pub errors: Vec<ExecutionError>,
    pub cancel: CancellationToken,
    pub context_usage: Option<ContextUsage>,
    pub context_window_threshold: f64,
    /// Model resolved for this node, if any.
    pub model: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub events: EventEmitter,
}

impl ExecutionContext {
    /// A standalone context, mainly for driving a node outside the executor.
    pub fn new(node_id: impl Into<NodeId>, state: WorkflowState, config: Arc<GraphConfig>) -> Self {
        let context_window_threshold = config.context_window_threshold;
        Self {
            node_id: node_id.into(),
            state,
            config,
            errors: Vec::new(),
            cancel: CancellationToken::new(),
            context_usage: None,
            context_window_threshold,
            model: None,
            attempt: 1,
            events: EventEmitter::default(),
        }
    }

    pub fn runtime(&self) -> &RuntimeDeps {
        &self.config.runtime
    }

    /// Emit a named event tagged with this node's id.
    pub fn emit(&self, name: impl Into<String>, data: Value) {
        self.events.emit(NodeEvent::new(self.node_id.clone(), name, data));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A prompt or message resolved against the state at run time.
#[derive(Clone)]
pub enum Prompt {
    /// Text with `{{field}}` or `{{outputs.node}}` placeholders.
    Template(String),
    Derived(Arc<dyn Fn(&WorkflowState) -> String + Send + Sync>),
}

impl Prompt {
    pub fn derived(f: impl Fn(&WorkflowState) -> String + Send + Sync + 'static) -> Self {
        Self::Derived(Arc::new(f))
    }

    pub fn resolve(&self, state: &WorkflowState) -> String {
        match self {
            Self::Template(text) => render_template(text, state),
            Self::Derived(f) => f(state),
        }
    }
}

impl fmt::Debug for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(text) => f.debug_tuple("Template").field(text).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Template(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Template(text)
    }
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("template pattern is valid")
    })
}

/// Replace `{{key}}` placeholders with state values.
///
/// Strings are inserted as-is, other values as JSON. Unknown keys render empty.
pub fn render_template(text: &str, state: &WorkflowState) -> String {
    template_pattern()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            let value = match key.strip_prefix("outputs.") {
                Some(node) => state.output(node),
                None => state.get(key),
            };
            match value {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            }
        })
        .into_owned()
}

/// A node in a compiled graph.
#[derive(Clone)]
pub struct NodeDefinition {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: Option<String>,
    pub execute: ExecuteFn,
    pub retry: Option<RetryPolicy>,
    pub error_handler: Option<ErrorHandler>,
    /// May be entered through an error handler's goto.
    pub is_recovery_target: bool,
    pub model: Option<ModelHint>,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub on_resume: Option<ResumeMapper>,
    pub(crate) is_loop_node: bool,
}

impl NodeDefinition {
    pub fn new<F, Fut>(id: impl Into<NodeId>, kind: NodeKind, execute: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeResult>> + Send + 'static,
    {
        Self {
            id: id.into(),
            kind,
            name: None,
            execute: Arc::new(move |ctx| -> BoxFuture<'static, Result<NodeResult>> {
                Box::pin(execute(ctx))
            }),
            retry: None,
            error_handler: None,
            is_recovery_target: false,
            model: None,
            input_schema: None,
            output_schema: None,
            on_resume: None,
            is_loop_node: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&waypoint_core::WaypointError, &WorkflowState, u32) -> ErrorAction
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Allow error handlers to jump here.
    pub fn recovery_target(mut self) -> Self {
        self.is_recovery_target = true;
        self
    }

    pub fn with_model(mut self, model: ModelHint) -> Self {
        self.model = Some(model);
        self
    }

    /// Validate the state against `schema` before running.
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Validate the update's fields against `schema` after running.
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn on_resume(
        mut self,
        mapper: impl Fn(Value, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.on_resume = Some(Arc::new(mapper));
        self
    }

    /// Part of a loop, so it may run more than once.
    pub fn is_loop_node(&self) -> bool {
        self.is_loop_node
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Update applied when resuming at this node with `input`.
    pub fn resume_update(&self, input: Value, state: &WorkflowState) -> StateUpdate {
        match &self.on_resume {
            Some(mapper) => mapper(input, state),
            None => StateUpdate::new().output(self.id.clone(), input),
        }
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("is_recovery_target", &self.is_recovery_target)
            .field("model", &self.model)
            .field("is_loop_node", &self.is_loop_node)
            .finish_non_exhaustive()
    }
}
