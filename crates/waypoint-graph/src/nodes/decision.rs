use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{NodeId, NodeKind};

use crate::edge::Condition;
use crate::node::{ExecutionContext, NodeDefinition, NodeResult};

/// Ordered routes for [`decision_node`]; the first matching route wins.
#[derive(Clone)]
pub struct DecisionConfig {
    pub id: NodeId,
    pub routes: Vec<(Condition, NodeId)>,
    pub fallback: Option<NodeId>,
}

impl DecisionConfig {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            routes: vec![],
            fallback: None,
        }
    }

    pub fn route(
        mut self,
        condition: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        target: impl Into<NodeId>,
    ) -> Self {
        self.routes.push((Arc::new(condition), target.into()));
        self
    }

    pub fn fallback(mut self, target: impl Into<NodeId>) -> Self {
        self.fallback = Some(target.into());
        self
    }
}

/// Pick a successor by evaluating routes in order.
///
/// With no match and no fallback the node's outgoing edges decide.
pub fn decision_node(config: DecisionConfig) -> NodeDefinition {
    let id = config.id.clone();
    let config = Arc::new(config);

    NodeDefinition::new(id, NodeKind::Decision, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let target = config
                .routes
                .iter()
                .find(|(condition, _)| condition(&ctx.state))
                .map(|(_, target)| target.clone())
                .or_else(|| config.fallback.clone());

            debug!(node_id = %ctx.node_id, target = ?target, "Decision evaluated");

            let update = StateUpdate::new().output(ctx.node_id.clone(), json!({ "target": target }));
            let result = NodeResult::from_update(update);
            Ok(match target {
                Some(target) => result.goto(target),
                None => result,
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;

    async fn decide(state: WorkflowState) -> NodeResult {
        let node = decision_node(
            DecisionConfig::new("route")
                .route(|s| s.get_i64("score").unwrap_or(0) >= 80, "publish")
                .route(|s| s.get_i64("score").unwrap_or(0) >= 50, "revise")
                .fallback("reject"),
        );
        let ctx = ExecutionContext::new("route", state, Arc::new(GraphConfig::default()));
        (node.execute)(ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let result = decide(WorkflowState::new("x").with_field("score", json!(90))).await;
        assert_eq!(result.goto, Some(vec!["publish".to_string()]));

        let result = decide(WorkflowState::new("x").with_field("score", json!(60))).await;
        assert_eq!(result.goto, Some(vec!["revise".to_string()]));
        assert_eq!(result.update.unwrap().outputs["route"], json!({"target": "revise"}));
    }

    #[tokio::test]
    async fn test_fallback_and_no_match() {
        let result = decide(WorkflowState::new("x")).await;
        assert_eq!(result.goto, Some(vec!["reject".to_string()]));

        let node = decision_node(DecisionConfig::new("route").route(|_| false, "never"));
        let ctx = ExecutionContext::new("route", WorkflowState::new("x"), Arc::new(GraphConfig::default()));
        let result = (node.execute)(ctx).await.unwrap();
        assert_eq!(result.goto, None);
    }
}
