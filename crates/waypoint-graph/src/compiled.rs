use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use waypoint_core::state::WorkflowState;
use waypoint_core::types::{NodeId, NodeKind};

use crate::config::GraphConfig;
use crate::edge::Edge;
use crate::node::NodeDefinition;
use crate::nodes::ParallelConfig;
use crate::retry::ErrorHandler;

/// A frozen, validated graph ready to execute.
#[derive(Clone)]
pub struct CompiledGraph {
    pub(crate) nodes: HashMap<NodeId, NodeDefinition>,
    pub(crate) order: Vec<NodeId>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) start: NodeId,
    pub(crate) ends: Vec<NodeId>,
    pub(crate) parallel_groups: HashMap<NodeId, ParallelConfig>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) config: GraphConfig,
}

/// Serializable outline of a graph's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStructure {
    pub start: NodeId,
    pub nodes: Vec<(NodeId, NodeKind)>,
    pub edges: Vec<EdgeOutline>,
    pub ends: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeOutline {
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub conditional: bool,
}

impl CompiledGraph {
    pub fn start_node(&self) -> &str {
        &self.start
    }

    pub fn end_nodes(&self) -> &[NodeId] {
        &self.ends
    }

    pub fn is_end(&self, id: &str) -> bool {
        self.ends.iter().any(|e| e == id)
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Targets of every outgoing edge of `id` whose condition holds, in
    /// insertion order.
    pub fn next_nodes(&self, id: &str, state: &WorkflowState) -> Vec<NodeId> {
        self.outgoing(id)
            .filter(|e| e.matches(state))
            .map(|e| e.to.clone())
            .collect()
    }

    pub fn parallel_group(&self, id: &str) -> Option<&ParallelConfig> {
        self.parallel_groups.get(id)
    }

    pub fn error_handler(&self) -> Option<&ErrorHandler> {
        self.error_handler.as_ref()
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The same graph with different settings and runtime.
    pub fn with_config(&self, config: GraphConfig) -> Self {
        Self {
            config,
            ..self.clone()
        }
    }

    pub fn structure(&self) -> GraphStructure {
        GraphStructure {
            start: self.start.clone(),
            nodes: self.nodes().map(|n| (n.id.clone(), n.kind)).collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeOutline {
                    from: e.from.clone(),
                    to: e.to.clone(),
                    label: e.label.clone(),
                    conditional: e.is_conditional(),
                })
                .collect(),
            ends: self.ends.clone(),
        }
    }

    /// Render as a Mermaid flowchart.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("flowchart TD\n");
        for node in self.nodes() {
            out.push_str(&format!("    {}[\"{} ({})\"]\n", node.id, node.display_name(), node.kind));
        }
        for edge in &self.edges {
            let arrow = if edge.is_conditional() { "-.->" } else { "-->" };
            match &edge.label {
                Some(label) => out.push_str(&format!("    {} {arrow}|{label}| {}\n", edge.from, edge.to)),
                None => out.push_str(&format!("    {} {arrow} {}\n", edge.from, edge.to)),
            }
        }
        out
    }
}

impl fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("start", &self.start)
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .field("ends", &self.ends)
            .finish_non_exhaustive()
    }
}
