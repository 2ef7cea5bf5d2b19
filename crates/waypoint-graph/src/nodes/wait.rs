use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{AskUserOption, NodeId, NodeKind, Signal};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult, Prompt, ResumeMapper};
use crate::nodes::{ASK_USER_REQUEST_ID, WAITING_FOR_INPUT, WAIT_NODE_ID};

/// Configuration for [`wait_node`].
#[derive(Clone)]
pub struct WaitConfig {
    pub prompt: Prompt,
    /// Continue immediately as if empty input had been supplied.
    pub auto_approve: bool,
    /// Maps resume input to a state update. Defaults to `outputs[id] = input`.
    pub input: Option<ResumeMapper>,
}

impl WaitConfig {
    pub fn new(prompt: impl Into<Prompt>) -> Self {
        Self {
            prompt: prompt.into(),
            auto_approve: false,
            input: None,
        }
    }

    pub fn auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_input(
        mut self,
        mapper: impl Fn(Value, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.input = Some(Arc::new(mapper));
        self
    }
}

impl From<&str> for WaitConfig {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<String> for WaitConfig {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

/// Pause for host input.
///
/// The pending-input flags are set on pause and cleared when the node is
/// resumed. With `auto_approve` the input mapper runs on empty input and the
/// run continues.
pub fn wait_node(id: impl Into<NodeId>, config: WaitConfig) -> NodeDefinition {
    let id = id.into();
    let input = config.input.clone();
    let config = Arc::new(config);

    let node = NodeDefinition::new(id, NodeKind::Wait, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            if config.auto_approve {
                let update = apply_input(&config.input, &ctx.node_id, Value::Null, &ctx.state);
                return Ok(NodeResult::from_update(update));
            }

            let prompt = config.prompt.resolve(&ctx.state);
            info!(node_id = %ctx.node_id, "Waiting for input");
            let update = StateUpdate::new()
                .set(WAITING_FOR_INPUT, Value::Bool(true))
                .set(WAIT_NODE_ID, Value::String(ctx.node_id.clone()));
            Ok(NodeResult::from_update(update).signal(Signal::pause(prompt)))
        }
    });

    let node_id = node.id.clone();
    node.on_resume(move |value, state| {
        apply_input(&input, &node_id, value, state).extend(clear_flags())
    })
}

fn apply_input(
    mapper: &Option<ResumeMapper>,
    node_id: &str,
    value: Value,
    state: &WorkflowState,
) -> StateUpdate {
    match mapper {
        Some(mapper) => mapper(value, state),
        None => StateUpdate::new().output(node_id.to_string(), value),
    }
}

fn clear_flags() -> StateUpdate {
    StateUpdate::new()
        .set(WAITING_FOR_INPUT, Value::Bool(false))
        .set(WAIT_NODE_ID, Value::Null)
}

/// Options offered by an ask-user node.
#[derive(Clone)]
pub enum AskUserOptions {
    Static(Vec<AskUserOption>),
    Derived(Arc<dyn Fn(&WorkflowState) -> Vec<AskUserOption> + Send + Sync>),
}

impl AskUserOptions {
    pub fn resolve(&self, state: &WorkflowState) -> Vec<AskUserOption> {
        match self {
            Self::Static(options) => options.clone(),
            Self::Derived(f) => f(state),
        }
    }
}

/// Configuration for [`ask_user_node`].
#[derive(Clone)]
pub struct AskUserConfig {
    pub id: NodeId,
    pub question: Prompt,
    pub header: Option<String>,
    pub options: AskUserOptions,
    pub multi_select: bool,
}

impl AskUserConfig {
    pub fn new(id: impl Into<NodeId>, question: impl Into<Prompt>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            header: None,
            options: AskUserOptions::Static(vec![]),
            multi_select: false,
        }
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_options(mut self, options: Vec<AskUserOption>) -> Self {
        self.options = AskUserOptions::Static(options);
        self
    }

    pub fn with_derived_options(
        mut self,
        f: impl Fn(&WorkflowState) -> Vec<AskUserOption> + Send + Sync + 'static,
    ) -> Self {
        self.options = AskUserOptions::Derived(Arc::new(f));
        self
    }

    pub fn multi_select(mut self, multi_select: bool) -> Self {
        self.multi_select = multi_select;
        self
    }
}

/// Pose a structured question and pause until the host answers.
///
/// Emits a `human_input_required` event carrying the request. On resume the
/// answer lands in `outputs[id]` as `{ answer, request_id }`.
pub fn ask_user_node(config: AskUserConfig) -> NodeDefinition {
    let id = config.id.clone();
    let config = Arc::new(config);

    let node = NodeDefinition::new(id, NodeKind::AskUser, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let request_id = Uuid::new_v4().to_string();
            let question = config.question.resolve(&ctx.state);
            let options = config.options.resolve(&ctx.state);

            ctx.emit(
                "human_input_required",
                json!({
                    "request_id": request_id,
                    "node_id": ctx.node_id,
                    "question": question,
                    "header": config.header,
                    "options": options,
                    "multi_select": config.multi_select,
                }),
            );
            info!(node_id = %ctx.node_id, request_id = %request_id, "Asking user");

            let update = StateUpdate::new()
                .set(WAITING_FOR_INPUT, Value::Bool(true))
                .set(WAIT_NODE_ID, Value::String(ctx.node_id.clone()))
                .set(ASK_USER_REQUEST_ID, Value::String(request_id.clone()));
            Ok(NodeResult::from_update(update).signal(Signal::PauseForInput {
                prompt: question,
                request_id: Some(request_id),
                options,
            }))
        }
    });

    let node_id = node.id.clone();
    node.on_resume(move |answer, state| {
        let request_id = state.get(ASK_USER_REQUEST_ID).cloned().unwrap_or(Value::Null);
        StateUpdate::new()
            .output(node_id.clone(), json!({ "answer": answer, "request_id": request_id }))
            .extend(clear_flags())
            .set(ASK_USER_REQUEST_ID, Value::Null)
    })
}
