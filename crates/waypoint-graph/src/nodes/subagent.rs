use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::traits::{SpawnRequest, SubAgentEntry, SubAgentOutcome};
use waypoint_core::types::{NodeId, NodeKind};

use crate::node::{ExecutionContext, NodeDefinition, NodeResult, Prompt};
use crate::retry::RetryPolicy;

type SubagentOutput = Arc<dyn Fn(&SubAgentOutcome, &WorkflowState) -> StateUpdate + Send + Sync>;

/// Folds keyed outcomes of a parallel spawn into one update.
pub type SubagentCombiner =
    Arc<dyn Fn(&BTreeMap<String, SubAgentOutcome>, &WorkflowState) -> StateUpdate + Send + Sync>;

/// Configuration for [`subagent_node`].
#[derive(Clone)]
pub struct SubagentConfig {
    pub id: NodeId,
    /// Registered sub-agent type.
    pub agent_name: String,
    pub task: Prompt,
    /// Overrides the registered tool list.
    pub tools: Option<Vec<String>>,
    /// Defaults to the serialized outcome under `outputs[id]`.
    pub output: Option<SubagentOutput>,
    pub retry: Option<RetryPolicy>,
}

impl SubagentConfig {
    pub fn new(id: impl Into<NodeId>, agent_name: impl Into<String>, task: impl Into<Prompt>) -> Self {
        Self {
            id: id.into(),
            agent_name: agent_name.into(),
            task: task.into(),
            tools: None,
            output: None,
            retry: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_output(
        mut self,
        f: impl Fn(&SubAgentOutcome, &WorkflowState) -> StateUpdate + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(f));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Spawn one registered sub-agent through the bridge and wait for it.
pub fn subagent_node(config: SubagentConfig) -> NodeDefinition {
    let id = config.id.clone();
    let retry = config.retry.clone();
    let config = Arc::new(config);

    let mut node = NodeDefinition::new(id, NodeKind::Agent, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        async move {
            let bridge = ctx.runtime().subagent_bridge(&config.agent_name)?;
            let entry = ctx
                .runtime()
                .agent_registry
                .as_ref()
                .and_then(|r| r.get(&config.agent_name))
                .ok_or_else(|| WaypointError::ProviderNotFound {
                    kind: "sub-agent".to_string(),
                    name: config.agent_name.clone(),
                })?;

            let task = config.task.resolve(&ctx.state);
            let request = spawn_request(&ctx, &entry, task, config.tools.clone());
            info!(node_id = %ctx.node_id, agent = %entry.name, agent_id = %request.agent_id, "Spawning sub-agent");

            let outcome = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(WaypointError::Cancelled),
                outcome = bridge.spawn(request) => outcome?,
            };
            if !outcome.success {
                return Err(WaypointError::SubAgent {
                    agent: outcome.agent_name,
                    message: outcome.error.unwrap_or_else(|| "no error reported".to_string()),
                });
            }

            let update = match &config.output {
                Some(f) => f(&outcome, &ctx.state),
                None => StateUpdate::new().output(ctx.node_id.clone(), serde_json::to_value(&outcome)?),
            };
            Ok(NodeResult::from_update(update))
        }
    });
    node.retry = retry;
    node
}

/// One sub-agent in a parallel spawn.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    /// Key in the combined outcome map. Defaults to the agent name.
    pub key: Option<String>,
    pub agent_name: String,
    pub task: String,
}

impl SubagentTask {
    pub fn new(agent_name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            key: None,
            agent_name: agent_name.into(),
            task: task.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Configuration for [`parallel_subagent_node`].
#[derive(Clone)]
pub struct ParallelSubagentConfig {
    pub id: NodeId,
    pub agents: Vec<SubagentTask>,
    pub merge: Option<SubagentCombiner>,
}

impl ParallelSubagentConfig {
    pub fn new(id: impl Into<NodeId>, agents: Vec<SubagentTask>) -> Self {
        Self {
            id: id.into(),
            agents,
            merge: None,
        }
    }

    pub fn with_merge(
        mut self,
        f: impl Fn(&BTreeMap<String, SubAgentOutcome>, &WorkflowState) -> StateUpdate
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.merge = Some(Arc::new(f));
        self
    }
}

/// Spawn several sub-agents concurrently and merge their keyed outcomes.
///
/// A merge function is required. Task text is interpolated against state,
/// and repeated keys get a numeric suffix (`reviewer`, `reviewer-2`, ...).
pub fn parallel_subagent_node(config: ParallelSubagentConfig) -> Result<NodeDefinition> {
    let Some(merge) = config.merge.clone() else {
        return Err(WaypointError::InvalidNode {
            node: config.id,
            message: "parallel sub-agent node requires a merge function".to_string(),
        });
    };
    if config.agents.is_empty() {
        return Err(WaypointError::InvalidNode {
            node: config.id,
            message: "parallel sub-agent node needs at least one agent".to_string(),
        });
    }

    let id = config.id.clone();
    let keys = unique_keys(&config.agents);
    let config = Arc::new(config);

    Ok(NodeDefinition::new(id, NodeKind::Agent, move |ctx: ExecutionContext| {
        let config = Arc::clone(&config);
        let merge = Arc::clone(&merge);
        let keys = keys.clone();
        async move {
            let first = config.agents.first().map(|a| a.agent_name.as_str()).unwrap_or_default();
            let bridge = ctx.runtime().subagent_bridge(first)?;

            let requests: Vec<SpawnRequest> = config
                .agents
                .iter()
                .map(|agent| {
                    let entry = ctx
                        .runtime()
                        .agent_registry
                        .as_ref()
                        .and_then(|r| r.get(&agent.agent_name))
                        .unwrap_or_else(|| SubAgentEntry::new(agent.agent_name.clone()));
                    let task = Prompt::from(agent.task.as_str()).resolve(&ctx.state);
                    spawn_request(&ctx, &entry, task, None)
                })
                .collect();

            info!(node_id = %ctx.node_id, count = requests.len(), "Spawning sub-agents in parallel");
            let outcomes = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(WaypointError::Cancelled),
                outcomes = bridge.spawn_parallel(requests) => outcomes?,
            };

            if outcomes.len() != keys.len() {
                return Err(WaypointError::SubAgent {
                    agent: first.to_string(),
                    message: format!(
                        "bridge returned {} outcomes for {} requests",
                        outcomes.len(),
                        keys.len()
                    ),
                });
            }

            let mut keyed = BTreeMap::new();
            for (key, outcome) in keys.into_iter().zip(outcomes) {
                if !outcome.success {
                    warn!(node_id = %ctx.node_id, key = %key, error = ?outcome.error, "Sub-agent failed");
                }
                keyed.insert(key, outcome);
            }
            Ok(NodeResult::from_update(merge(&keyed, &ctx.state)))
        }
    }))
}

fn spawn_request(
    ctx: &ExecutionContext,
    entry: &SubAgentEntry,
    task: String,
    tools: Option<Vec<String>>,
) -> SpawnRequest {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    SpawnRequest {
        agent_id: format!("{}-{}-{suffix}", ctx.node_id, entry.name),
        agent_name: entry.name.clone(),
        task,
        system_prompt: entry.system_prompt.clone(),
        model: ctx.model.clone().or_else(|| entry.model.clone()),
        tools: tools.unwrap_or_else(|| entry.tools.clone()),
    }
}

fn unique_keys(agents: &[SubagentTask]) -> Vec<String> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    agents
        .iter()
        .map(|agent| {
            let base = agent.key.clone().unwrap_or_else(|| agent.agent_name.clone());
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}-{count}")
            }
        })
        .collect()
}

/// Default merge: every outcome's output text keyed by agent under `outputs[id]`.
pub fn collect_outputs(id: impl Into<NodeId>) -> SubagentCombiner {
    let id = id.into();
    Arc::new(move |outcomes, _state| {
        let map: serde_json::Map<String, Value> = outcomes
            .iter()
            .map(|(k, o)| (k.clone(), Value::String(o.output.clone())))
            .collect();
        StateUpdate::new().output(id.clone(), Value::Object(map))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_keys() {
        let agents = vec![
            SubagentTask::new("reviewer", "a"),
            SubagentTask::new("reviewer", "b"),
            SubagentTask::new("writer", "c").with_key("draft"),
            SubagentTask::new("reviewer", "d"),
        ];
        assert_eq!(unique_keys(&agents), vec!["reviewer", "reviewer-2", "draft", "reviewer-3"]);
    }

    #[test]
    fn test_parallel_requires_merge() {
        let err = parallel_subagent_node(ParallelSubagentConfig::new(
            "fan",
            vec![SubagentTask::new("reviewer", "x")],
        ))
        .unwrap_err();
        assert!(matches!(err, WaypointError::InvalidNode { .. }));

        let err = parallel_subagent_node(
            ParallelSubagentConfig::new("fan", vec![]).with_merge(|_, _| StateUpdate::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one agent"));
    }
}
