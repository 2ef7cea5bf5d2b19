use std::collections::HashMap;
use std::sync::Arc;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::{AgentSessionClient, SubAgentBridge, SubAgentRegistry};

use crate::compiled::CompiledGraph;
use crate::tools::ToolRegistry;

/// Looks up compiled workflows by name for subgraph nodes.
pub trait WorkflowResolver: Send + Sync + 'static {
    fn resolve(&self, name: &str) -> Option<Arc<CompiledGraph>>;
}

impl WorkflowResolver for HashMap<String, Arc<CompiledGraph>> {
    fn resolve(&self, name: &str) -> Option<Arc<CompiledGraph>> {
        self.get(name).cloned()
    }
}

/// Host-provided collaborators, reachable from every node.
#[derive(Clone, Default)]
pub struct RuntimeDeps {
    /// Agent session clients keyed by agent type.
    pub session_clients: HashMap<String, Arc<dyn AgentSessionClient>>,
    pub workflows: Option<Arc<dyn WorkflowResolver>>,
    pub subagents: Option<Arc<dyn SubAgentBridge>>,
    pub agent_registry: Option<Arc<dyn SubAgentRegistry>>,
    pub tools: Option<Arc<ToolRegistry>>,
}

impl RuntimeDeps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_client(
        mut self,
        agent_type: impl Into<String>,
        client: Arc<dyn AgentSessionClient>,
    ) -> Self {
        self.session_clients.insert(agent_type.into(), client);
        self
    }

    pub fn with_workflows(mut self, resolver: Arc<dyn WorkflowResolver>) -> Self {
        self.workflows = Some(resolver);
        self
    }

    pub fn with_subagents(
        mut self,
        bridge: Arc<dyn SubAgentBridge>,
        registry: Arc<dyn SubAgentRegistry>,
    ) -> Self {
        self.subagents = Some(bridge);
        self.agent_registry = Some(registry);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn session_client(&self, agent_type: &str) -> Result<Arc<dyn AgentSessionClient>> {
        self.session_clients
            .get(agent_type)
            .cloned()
            .ok_or_else(|| missing("agent session client", agent_type))
    }

    pub fn workflow(&self, name: &str) -> Result<Arc<CompiledGraph>> {
        let resolver = self
            .workflows
            .as_ref()
            .ok_or_else(|| missing("workflow resolver", name))?;
        resolver
            .resolve(name)
            .ok_or_else(|| WaypointError::Subgraph(format!("workflow '{name}' not found")))
    }

    pub fn subagent_bridge(&self, agent: &str) -> Result<Arc<dyn SubAgentBridge>> {
        self.subagents
            .clone()
            .ok_or_else(|| missing("sub-agent bridge", agent))
    }

    pub fn tool_registry(&self, tool: &str) -> Result<Arc<ToolRegistry>> {
        self.tools.clone().ok_or_else(|| missing("tool registry", tool))
    }
}

fn missing(kind: &str, name: &str) -> WaypointError {
    WaypointError::ProviderNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_providers_are_named() {
        let deps = RuntimeDeps::new();
        let err = deps.session_client("claude").err().unwrap();
        assert_eq!(
            err.to_string(),
            WaypointError::ProviderNotFound {
                kind: "agent session client".into(),
                name: "claude".into()
            }
            .to_string()
        );
        assert!(matches!(
            deps.workflow("child").err().unwrap(),
            WaypointError::ProviderNotFound { .. }
        ));
        assert!(deps.subagent_bridge("reviewer").is_err());
        assert!(deps.tool_registry("upper").is_err());
    }

    #[test]
    fn test_unknown_workflow() {
        let resolver: HashMap<String, Arc<CompiledGraph>> = HashMap::new();
        let deps = RuntimeDeps::new().with_workflows(Arc::new(resolver));
        assert!(matches!(
            deps.workflow("child").err().unwrap(),
            WaypointError::Subgraph(_)
        ));
    }
}
