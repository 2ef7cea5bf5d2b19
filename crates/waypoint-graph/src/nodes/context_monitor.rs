use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{ContextAction, ContextUsage, NodeId, NodeKind, Signal};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult};

type UsageAccessor = Arc<dyn Fn(&WorkflowState) -> Option<ContextUsage> + Send + Sync>;

/// Configuration for [`context_monitor_node`].
#[derive(Clone)]
pub struct ContextMonitorConfig {
    pub id: NodeId,
    /// Picks the default breach action.
    pub agent_type: String,
    /// Overrides the graph's threshold.
    pub threshold: Option<f64>,
    /// Overrides the agent type's default action.
    pub action: Option<ContextAction>,
    /// Reads usage from state. Falls back to the usage the executor tracked.
    pub usage: Option<UsageAccessor>,
}

impl ContextMonitorConfig {
    pub fn new(id: impl Into<NodeId>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            threshold: None,
            action: None,
            usage: None,
        }
    }

    pub fn with_threshold(mut self, pct: f64) -> Self {
        self.threshold = Some(pct);
        self
    }

    pub fn with_action(mut self, action: ContextAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_usage(
        mut self,
        f: impl Fn(&WorkflowState) -> Option<ContextUsage> + Send + Sync + 'static,
    ) -> Self {
        self.usage = Some(Arc::new(f));
        self
    }
}

/// Compare context usage to the threshold and signal the breach action.
pub fn context_monitor_node(config: ContextMonitorConfig) -> NodeDefinition {
    let id = config.id.clone();
    let config = Arc::new(config);

    NodeDefinition::new(id, NodeKind::Tool, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let usage = config
                .usage
                .as_ref()
                .and_then(|f| f(&ctx.state))
                .or(ctx.context_usage);
            let threshold = config.threshold.unwrap_or(ctx.context_window_threshold);

            let Some(usage) = usage else {
                let update = StateUpdate::new()
                    .output(ctx.node_id.clone(), json!({ "usage_pct": null, "breached": false }));
                return Ok(NodeResult::from_update(update));
            };

            let pct = usage.usage_pct();
            let breached = usage.exceeds(threshold);
            let action = config
                .action
                .unwrap_or_else(|| ContextAction::default_for_agent(&config.agent_type));
            let taken = breached.then_some(action);

            let update = StateUpdate::new().output(
                ctx.node_id.clone(),
                json!({
                    "usage_pct": pct,
                    "threshold": threshold,
                    "breached": breached,
                    "action": taken,
                }),
            );
            let mut result = NodeResult::from_update(update);

            if breached && action != ContextAction::None {
                warn!(
                    node_id = %ctx.node_id,
                    agent_type = %config.agent_type,
                    usage_pct = pct,
                    threshold,
                    "Context window threshold crossed"
                );
                result = result.signal(Signal::ContextWindowWarning {
                    action,
                    usage: Some(usage),
                    message: Some(format!("context at {pct:.0}% (threshold {threshold:.0}%)")),
                });
            }
            Ok(result)
        }
    })
}
