use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{MergeStrategy, NodeId, NodeKind};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult};

/// Folds branch outputs into a single update. Recorded on the graph for the
/// host; the executor does not call it.
pub type ParallelCombiner =
    Arc<dyn Fn(&BTreeMap<NodeId, Value>, &WorkflowState) -> StateUpdate + Send + Sync>;

/// Configuration for [`parallel_node`].
#[derive(Clone)]
pub struct ParallelConfig {
    pub id: NodeId,
    pub branches: Vec<NodeId>,
    pub strategy: MergeStrategy,
    pub merge: Option<ParallelCombiner>,
}

impl ParallelConfig {
    pub fn new(id: impl Into<NodeId>, branches: Vec<NodeId>) -> Self {
        Self {
            id: id.into(),
            branches,
            strategy: MergeStrategy::All,
            merge: None,
        }
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_merge(
        mut self,
        merge: impl Fn(&BTreeMap<NodeId, Value>, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.merge = Some(Arc::new(merge));
        self
    }

    /// Apply the combiner to whatever branch outputs are present in `state`.
    pub fn combine(&self, state: &WorkflowState) -> Option<StateUpdate> {
        let merge = self.merge.as_ref()?;
        let outputs: BTreeMap<NodeId, Value> = self
            .branches
            .iter()
            .filter_map(|b| state.output(b).map(|v| (b.clone(), v.clone())))
            .collect();
        Some(merge(&outputs, state))
    }
}

impl fmt::Debug for ParallelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelConfig")
            .field("id", &self.id)
            .field("branches", &self.branches)
            .field("strategy", &self.strategy)
            .field("merge", &self.merge.is_some())
            .finish()
    }
}

/// Fan out to every branch.
///
/// Records the branch list and strategy under `outputs[id]` and routes to all
/// branches at once.
pub fn parallel_node(config: &ParallelConfig) -> NodeDefinition {
    let branches = config.branches.clone();
    let summary = json!({
        "branches": config.branches,
        "strategy": config.strategy,
        "has_merge": config.merge.is_some(),
    });

    NodeDefinition::new(config.id.clone(), NodeKind::Parallel, move |ctx: ExecutionContext| {
        let branches = branches.clone();
        let summary = summary.clone();
        async move {
            let update = StateUpdate::new().output(ctx.node_id.clone(), summary);
            Ok(NodeResult::from_update(update).goto_all(branches))
        }
    })
}
