use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use waypoint_core::error::WaypointError;
use waypoint_core::event::{ProgressEvent, ProgressKind};
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{
    ContextUsage, ExecutionError, ExecutionSnapshot, ExecutionStatus, ModelHint, NodeEvent, NodeId,
    Signal,
};

use crate::compiled::CompiledGraph;
use crate::config::GraphConfig;
use crate::node::{EventEmitter, ExecutionContext, NodeDefinition, NodeResult};
use crate::retry::ErrorAction;
use crate::runtime::RuntimeDeps;
use crate::schema;
use crate::state::{init_state, merge_state, without_reserved};

/// How to start (or resume) an execution.
#[derive(Clone, Default)]
pub struct ExecutionOptions {
    pub execution_id: Option<String>,
    /// Full initial state. Takes precedence over `fields`.
    pub initial_state: Option<WorkflowState>,
    pub fields: Map<String, Value>,
    pub resume_from: Option<ExecutionSnapshot>,
    /// Input for the node the snapshot paused at.
    pub resume_input: Option<Value>,
    pub cancel: Option<CancellationToken>,
    /// Model resolved by an enclosing workflow.
    pub parent_model: Option<String>,
    /// Replaces the graph's runtime for this run.
    pub runtime: Option<RuntimeDeps>,
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("execution_id", &self.execution_id)
            .field("initial_state", &self.initial_state)
            .field("resume_from", &self.resume_from.as_ref().map(|s| &s.execution_id))
            .field("parent_model", &self.parent_model)
            .field("runtime_override", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a snapshot.
    pub fn resume(snapshot: ExecutionSnapshot) -> Self {
        Self {
            resume_from: Some(snapshot),
            ..Self::default()
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.execution_id = Some(id.into());
        self
    }

    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_resume_input(mut self, input: Value) -> Self {
        self.resume_input = Some(input);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_parent_model(mut self, model: impl Into<String>) -> Self {
        self.parent_model = Some(model.into());
        self
    }

    /// Run with these collaborators instead of the graph's.
    pub fn with_runtime(mut self, runtime: RuntimeDeps) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

/// One traversal step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub node_id: NodeId,
    pub status: ExecutionStatus,
    /// State after the step.
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<StateUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<Vec<NodeId>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<Signal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<NodeEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub attempts: u32,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub snapshot: ExecutionSnapshot,
}

impl StepResult {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Final result of [`GraphExecutor::execute`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub state: WorkflowState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub snapshot: ExecutionSnapshot,
    /// Node ids in the order they ran.
    pub path: Vec<NodeId>,
}

/// Runs a compiled graph.
#[derive(Clone)]
pub struct GraphExecutor {
    graph: Arc<CompiledGraph>,
}

impl GraphExecutor {
    pub fn new(graph: impl Into<Arc<CompiledGraph>>) -> Self {
        Self { graph: graph.into() }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Traverse the graph, yielding one [`StepResult`] per node.
    ///
    /// The stream ends after the first terminal step (completed, failed,
    /// cancelled or paused).
    pub fn stream(&self, options: ExecutionOptions) -> BoxStream<'static, StepResult> {
        let graph = Arc::clone(&self.graph);
        let mut config = graph.config().clone();
        if let Some(runtime) = options.runtime.clone() {
            config.runtime = runtime;
        }
        let config = Arc::new(config);
        let cancel = options.cancel.clone().unwrap_or_default();
        let parent_model = options.parent_model.clone();
        let mut run = Run::from_options(&graph, options);

        Box::pin(async_stream::stream! {
            info!(
                execution_id = %run.state.execution_id,
                start = %graph.start_node(),
                pending = run.queue.len(),
                "Starting graph execution"
            );

            loop {
                if run.queue.is_empty() {
                    break;
                }
                if cancel.is_cancelled() {
                    info!(execution_id = %run.state.execution_id, "Execution cancelled");
                    yield run.terminal(ExecutionStatus::Cancelled, None);
                    return;
                }
                let Some(node_id) = run.queue.pop_front() else { break };

                let Some(node) = graph.node(&node_id) else {
                    warn!(node_id = %node_id, "Skipping unknown node");
                    run.errors.push(ExecutionError::new(
                        node_id.clone(),
                        WaypointError::UnknownNode(node_id.clone()).to_string(),
                        0,
                    ));
                    continue;
                };

                if run.seen.contains(&node_id)
                    && !node.is_loop_node()
                    && !run.recovery_entries.contains(&node_id)
                {
                    debug!(node_id = %node_id, "Node already visited, skipping");
                    continue;
                }

                // Only a node that would actually run counts against the budget
                if run.step_count >= config.max_steps {
                    let err = WaypointError::MaxStepsExceeded(config.max_steps);
                    error!(execution_id = %run.state.execution_id, max_steps = config.max_steps, "Step budget exhausted");
                    run.queue.push_front(node_id.clone());
                    let recorded = ExecutionError::new(node_id, err.to_string(), 0);
                    run.errors.push(recorded.clone());
                    yield run.terminal(ExecutionStatus::Failed, Some(recorded));
                    return;
                }
                run.recovery_entries.remove(&node_id);

                run.step_count += 1;
                run.current = Some(node_id.clone());
                run.visited.push(node_id.clone());
                run.seen.insert(node_id.clone());
                progress(&config, ProgressKind::NodeStarted, &node_id, &run.state, None);

                let model = resolve_model(
                    node.model.as_ref(),
                    parent_model.as_deref(),
                    config.default_model.as_ref(),
                );
                info!(node_id = %node_id, kind = %node.kind, model = ?model, "Executing node");

                let (tx, mut rx) = mpsc::unbounded_channel();
                let ctx = ExecutionContext {
                    node_id: node_id.clone(),
                    state: run.state.clone(),
                    config: Arc::clone(&config),
                    errors: Vec::new(),
                    cancel: cancel.clone(),
                    context_usage: run.context_usage,
                    context_window_threshold: config.context_window_threshold,
                    model: model.clone(),
                    attempt: 1,
                    events: EventEmitter::new(tx),
                };

                let started = Instant::now();
                let attempted = execute_with_retry(&graph, &config, node, ctx, &mut run).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                let mut events = Vec::new();
                while let Ok(event) = rx.try_recv() {
                    events.push(event);
                }

                let (result, next, attempts) = match attempted {
                    Err(failure) => {
                        if failure.error.is_cancelled() {
                            info!(node_id = %node_id, "Node cancelled");
                            let mut step = run.terminal(ExecutionStatus::Cancelled, None);
                            step.events = events;
                            step.attempts = failure.attempts;
                            yield step;
                            return;
                        }
                        let wrapped = failure.error.in_node(node_id.clone());
                        error!(node_id = %node_id, attempts = failure.attempts, error = %wrapped, "Node failed");
                        progress(&config, ProgressKind::NodeError, &node_id, &run.state, Some(wrapped.to_string()));
                        let recorded = ExecutionError::new(node_id.clone(), wrapped.to_string(), failure.attempts);
                        run.errors.push(recorded.clone());
                        let mut step = run.terminal(ExecutionStatus::Failed, Some(recorded));
                        step.events = events;
                        step.attempts = failure.attempts;
                        step.execution_time_ms = elapsed_ms;
                        step.model = model;
                        yield step;
                        return;
                    }
                    Ok(Attempted::Done { result, attempts }) => {
                        let next = result.goto.clone();
                        (result, next, attempts)
                    }
                    Ok(Attempted::Skipped { fallback, attempts }) => {
                        let result = NodeResult { update: fallback, ..NodeResult::default() };
                        (result, None, attempts)
                    }
                    Ok(Attempted::Recover { target, attempts }) => {
                        run.recovery_entries.insert(target.clone());
                        (NodeResult::default(), Some(vec![target]), attempts)
                    }
                };

                if let Some(update) = &result.update {
                    run.state = merge_state(&run.state, update);
                }

                let paused = result.signals.iter().any(Signal::is_pause);
                // A pausing node routes only once its resume input is merged,
                // unless it named its successors explicitly.
                match next {
                    Some(targets) => run.enqueue(targets),
                    None if paused => run.route_on_resume = true,
                    None => {
                        let targets = graph.next_nodes(&node_id, &run.state);
                        run.enqueue(targets);
                    }
                }

                for signal in &result.signals {
                    match signal {
                        Signal::PauseForInput { prompt, .. } => {
                            info!(node_id = %node_id, prompt = %prompt, "Pausing for input");
                        }
                        Signal::Checkpoint { label } => {
                            let label = label.clone().unwrap_or_else(|| format!("step-{}", run.step_count));
                            persist(&config, &run, ExecutionStatus::Running, label).await;
                        }
                        Signal::ContextWindowWarning { action, usage, message } => {
                            if let Some(usage) = usage {
                                run.context_usage = Some(*usage);
                            }
                            warn!(
                                node_id = %node_id,
                                action = ?action,
                                usage_pct = usage.map(|u| u.usage_pct()),
                                message = message.as_deref().unwrap_or(""),
                                "Context window warning"
                            );
                        }
                    }
                }
                run.signals = result.signals.clone();

                let status = if paused {
                    ExecutionStatus::Paused
                } else if run.queue.is_empty() {
                    if !graph.is_end(&node_id) {
                        warn!(node_id = %node_id, "No successors from a non-end node, finishing");
                    }
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Running
                };

                if config.auto_checkpoint || paused {
                    persist(&config, &run, status, format!("step-{}", run.step_count)).await;
                }
                progress(&config, ProgressKind::NodeCompleted, &node_id, &run.state, None);

                let step = StepResult {
                    node_id: node_id.clone(),
                    status,
                    state: run.state.clone(),
                    update: result.update,
                    goto: result.goto,
                    signals: result.signals,
                    events,
                    error: None,
                    attempts,
                    execution_time_ms: elapsed_ms,
                    model,
                    snapshot: run.snapshot(status),
                };
                debug!(node_id = %node_id, status = %status, elapsed_ms, "Step finished");
                yield step;
                if status.is_terminal() {
                    return;
                }
            }

            info!(execution_id = %run.state.execution_id, steps = run.step_count, "Execution completed");
            yield run.terminal(ExecutionStatus::Completed, None);
        })
    }

    /// Drain the stream to its terminal step.
    pub async fn execute(&self, options: ExecutionOptions) -> ExecutionOutcome {
        let mut stream = self.stream(options);
        let mut path = Vec::new();
        let mut last = None;
        while let Some(step) = stream.next().await {
            if step.attempts > 0 {
                path.push(step.node_id.clone());
            }
            last = Some(step);
        }

        // The stream always ends with a terminal step
        let step = last.unwrap_or_else(|| {
            Run::from_options(&self.graph, ExecutionOptions::default())
                .terminal(ExecutionStatus::Failed, None)
        });
        ExecutionOutcome {
            execution_id: step.snapshot.execution_id.clone(),
            status: step.status,
            state: step.state,
            error: step.error,
            snapshot: step.snapshot,
            path,
        }
    }
}

/// Mutable traversal bookkeeping.
struct Run {
    state: WorkflowState,
    queue: VecDeque<NodeId>,
    visited: Vec<NodeId>,
    seen: HashSet<NodeId>,
    errors: Vec<ExecutionError>,
    signals: Vec<Signal>,
    current: Option<NodeId>,
    started_at: DateTime<Utc>,
    /// Node attempts, retries included.
    node_execution_count: usize,
    /// Nodes run, counted against the step budget.
    step_count: usize,
    context_usage: Option<ContextUsage>,
    recovery_entries: HashSet<NodeId>,
    /// The current node paused before its successors were resolved.
    route_on_resume: bool,
}

impl Run {
    fn from_options(graph: &CompiledGraph, options: ExecutionOptions) -> Self {
        match options.resume_from {
            Some(snapshot) => Self::restore(graph, snapshot, options.resume_input),
            None => {
                let mut state = match options.initial_state {
                    Some(mut state) => {
                        state.fields = without_reserved(state.fields);
                        state
                    }
                    None => init_state(None, options.fields),
                };
                if let Some(id) = options.execution_id {
                    state.execution_id = id;
                }
                Self {
                    state,
                    queue: VecDeque::from([graph.start_node().to_string()]),
                    visited: Vec::new(),
                    seen: HashSet::new(),
                    errors: Vec::new(),
                    signals: Vec::new(),
                    current: None,
                    started_at: Utc::now(),
                    node_execution_count: 0,
                    step_count: 0,
                    context_usage: None,
                    recovery_entries: HashSet::new(),
                    route_on_resume: false,
                }
            }
        }
    }

    fn restore(graph: &CompiledGraph, snapshot: ExecutionSnapshot, input: Option<Value>) -> Self {
        let mut state = snapshot.state;
        let current = snapshot.current_node.as_deref().and_then(|id| graph.node(id));
        if snapshot.status == ExecutionStatus::Paused {
            if let Some(node) = current {
                let update = node.resume_update(input.unwrap_or(Value::Null), &state);
                state = merge_state(&state, &update);
                debug!(node_id = %node.id, "Applied resume input");
            }
        } else if input.is_some() {
            warn!(status = %snapshot.status, "Resume input ignored for a snapshot that is not paused");
        }

        let mut run = Self {
            queue: snapshot.pending_nodes.into_iter().collect(),
            seen: snapshot.visited_nodes.iter().cloned().collect(),
            visited: snapshot.visited_nodes,
            errors: snapshot.errors,
            signals: Vec::new(),
            current: snapshot.current_node.clone(),
            started_at: snapshot.started_at,
            node_execution_count: snapshot.node_execution_count,
            step_count: snapshot.step_count,
            context_usage: snapshot.context_usage,
            recovery_entries: HashSet::new(),
            route_on_resume: false,
            state,
        };
        if snapshot.route_on_resume {
            if let Some(node) = current {
                let targets = graph.next_nodes(&node.id, &run.state);
                debug!(node_id = %node.id, targets = ?targets, "Routing paused node");
                run.enqueue(targets);
            }
        }
        run
    }

    fn enqueue(&mut self, ids: Vec<NodeId>) {
        for id in ids {
            if !self.queue.contains(&id) {
                self.queue.push_back(id);
            }
        }
    }

    fn snapshot(&self, status: ExecutionStatus) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.state.execution_id.clone(),
            state: self.state.clone(),
            status,
            current_node: self.current.clone(),
            visited_nodes: self.visited.clone(),
            errors: self.errors.clone(),
            signals: self.signals.clone(),
            pending_nodes: self.queue.iter().cloned().collect(),
            started_at: self.started_at,
            updated_at: Utc::now(),
            node_execution_count: self.node_execution_count,
            step_count: self.step_count,
            context_usage: self.context_usage,
            route_on_resume: self.route_on_resume,
        }
    }

    /// A step that reports the run's status without running a node.
    fn terminal(&self, status: ExecutionStatus, error: Option<ExecutionError>) -> StepResult {
        StepResult {
            node_id: self.current.clone().unwrap_or_default(),
            status,
            state: self.state.clone(),
            update: None,
            goto: None,
            signals: Vec::new(),
            events: Vec::new(),
            error,
            attempts: 0,
            execution_time_ms: 0,
            model: None,
            snapshot: self.snapshot(status),
        }
    }
}

enum Attempted {
    Done { result: NodeResult, attempts: u32 },
    Skipped { fallback: Option<StateUpdate>, attempts: u32 },
    Recover { target: NodeId, attempts: u32 },
}

struct NodeFailure {
    error: WaypointError,
    attempts: u32,
}

/// Run one node, retrying and consulting error handlers as configured.
async fn execute_with_retry(
    graph: &CompiledGraph,
    config: &GraphConfig,
    node: &NodeDefinition,
    base: ExecutionContext,
    run: &mut Run,
) -> std::result::Result<Attempted, NodeFailure> {
    let policy = node.retry.as_ref().unwrap_or(&config.retry);
    let handler = node.error_handler.as_ref().or(graph.error_handler());
    let mut attempt: u32 = 1;

    loop {
        let mut ctx = base.clone();
        ctx.attempt = attempt;
        ctx.errors = run.errors.clone();
        run.node_execution_count += 1;

        let error = match run_once(node, ctx).await {
            Ok(result) => return Ok(Attempted::Done { result, attempts: attempt }),
            Err(error) => error,
        };
        if error.is_cancelled() || base.cancel.is_cancelled() {
            return Err(NodeFailure {
                error: WaypointError::Cancelled,
                attempts: attempt,
            });
        }

        warn!(node_id = %node.id, attempt, error = %error, "Node attempt failed");
        run.errors
            .push(ExecutionError::new(node.id.clone(), error.to_string(), attempt));

        let action = match handler {
            Some(handler) => handler(&error, &base.state, attempt),
            None if policy.should_retry(&error) => ErrorAction::retry(),
            None => ErrorAction::Abort,
        };

        match action {
            ErrorAction::Skip { fallback } => {
                info!(node_id = %node.id, "Error handled, skipping node");
                return Ok(Attempted::Skipped {
                    fallback,
                    attempts: attempt,
                });
            }
            ErrorAction::Goto(target) => {
                let valid = graph.node(&target).is_some_and(|n| n.is_recovery_target);
                if !valid {
                    return Err(NodeFailure {
                        error: WaypointError::InvalidNode {
                            node: target,
                            message: "error handler jumped to a node that is not a recovery target"
                                .to_string(),
                        },
                        attempts: attempt,
                    });
                }
                info!(node_id = %node.id, target = %target, "Error handled, jumping to recovery node");
                return Ok(Attempted::Recover {
                    target,
                    attempts: attempt,
                });
            }
            ErrorAction::Abort => {
                return Err(NodeFailure {
                    error,
                    attempts: attempt,
                })
            }
            ErrorAction::Retry { delay } => {
                if attempt >= policy.max_attempts {
                    return Err(NodeFailure {
                        error,
                        attempts: attempt,
                    });
                }
                let delay = delay.unwrap_or_else(|| policy.delay_for_attempt(attempt));
                debug!(node_id = %node.id, attempt, delay_ms = delay.as_millis() as u64, "Retrying node");
                tokio::select! {
                    _ = base.cancel.cancelled() => {
                        return Err(NodeFailure { error: WaypointError::Cancelled, attempts: attempt });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

async fn run_once(node: &NodeDefinition, ctx: ExecutionContext) -> waypoint_core::Result<NodeResult> {
    if let Some(schema) = &node.input_schema {
        schema::validate(schema, &ctx.state.to_value(), &format!("node '{}' input", node.id))?;
    }
    let result = (node.execute)(ctx).await?;
    if let (Some(schema), Some(update)) = (&node.output_schema, &result.update) {
        schema::validate(schema, &update.fields_value(), &format!("node '{}' output", node.id))?;
    }
    Ok(result)
}

/// Node model, else the parent's, else the graph default. `inherit` skips a level.
pub fn resolve_model(
    node: Option<&ModelHint>,
    parent: Option<&str>,
    default: Option<&ModelHint>,
) -> Option<String> {
    if let Some(model) = node.and_then(ModelHint::explicit) {
        return Some(model.to_string());
    }
    parent
        .or_else(|| default.and_then(ModelHint::explicit))
        .map(str::to_string)
}

fn progress(
    config: &GraphConfig,
    kind: ProgressKind,
    node_id: &str,
    state: &WorkflowState,
    error: Option<String>,
) {
    if let Some(callback) = &config.on_progress {
        let mut event = ProgressEvent::new(kind, node_id, state);
        if let Some(error) = error {
            event = event.with_error(error);
        }
        callback(event);
    }
}

async fn persist(config: &GraphConfig, run: &Run, status: ExecutionStatus, label: String) {
    let Some(sink) = &config.checkpointer else {
        return;
    };
    let snapshot = run.snapshot(status);
    match sink.save(&snapshot.execution_id, &snapshot, Some(&label)).await {
        Ok(()) => {
            debug!(execution_id = %snapshot.execution_id, label = %label, "Checkpoint saved");
            let node_id = run.current.clone().unwrap_or_default();
            progress(config, ProgressKind::CheckpointSaved, &node_id, &run.state, None);
        }
        Err(e) => {
            warn!(execution_id = %snapshot.execution_id, label = %label, error = %e, "Checkpoint save failed");
        }
    }
}
