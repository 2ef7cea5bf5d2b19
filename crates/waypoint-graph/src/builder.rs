//! Fluent construction of workflow graphs.
//!
//! The builder keeps a cursor (the node the next `then` attaches to) and a
//! stack of open conditional branches. Structured steps (`if_`, `loop_`,
//! `parallel`, `wait`) expand into ordinary nodes and labelled edges, so a
//! compiled graph only ever contains nodes and edges.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::{StateUpdate, WorkflowState};
use waypoint_core::types::{NodeId, NodeKind};

use crate::compiled::CompiledGraph;
use crate::config::GraphConfig;
use crate::edge::{Condition, Edge};
use crate::node::{ExecutionContext, NodeDefinition, NodeResult};
use crate::nodes::{
    parallel_node, parallel_subagent_node, subagent_node, tool_node, wait_node,
    ParallelConfig, ParallelSubagentConfig, SubagentConfig, ToolNodeConfig, WaitConfig,
};
use crate::retry::{ErrorAction, ErrorHandler};
use crate::state::merge_state;

pub const LABEL_IF_TRUE: &str = "if-true";
pub const LABEL_IF_FALSE: &str = "if-false";
pub const LABEL_PARALLEL_BRANCH: &str = "parallel-branch";
pub const LABEL_LOOP_CONTINUE: &str = "loop-continue";

/// An `if / else-if / else` chain for [`GraphBuilder::if_chain`].
#[derive(Clone, Default)]
pub struct IfConfig {
    pub branches: Vec<(Condition, Vec<NodeDefinition>)>,
    pub otherwise: Option<Vec<NodeDefinition>>,
}

impl IfConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch. The first branch whose condition holds runs.
    pub fn when(
        mut self,
        condition: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        nodes: Vec<NodeDefinition>,
    ) -> Self {
        self.branches.push((Arc::new(condition), nodes));
        self
    }

    pub fn otherwise(mut self, nodes: Vec<NodeDefinition>) -> Self {
        self.otherwise = Some(nodes);
        self
    }
}

/// What [`GraphBuilder::wait`] inserts.
pub enum WaitStep {
    Config(WaitConfig),
    Node(NodeDefinition),
}

impl From<WaitConfig> for WaitStep {
    fn from(config: WaitConfig) -> Self {
        Self::Config(config)
    }
}

impl From<NodeDefinition> for WaitStep {
    fn from(node: NodeDefinition) -> Self {
        Self::Node(node)
    }
}

impl From<&str> for WaitStep {
    fn from(prompt: &str) -> Self {
        Self::Config(WaitConfig::new(prompt))
    }
}

impl From<String> for WaitStep {
    fn from(prompt: String) -> Self {
        Self::Config(WaitConfig::new(prompt))
    }
}

struct BranchFrame {
    decision: NodeId,
    condition: Condition,
    then_start: Option<NodeId>,
    then_end: Option<NodeId>,
    else_start: Option<NodeId>,
    in_else: bool,
}

/// Builds a [`CompiledGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<NodeId, NodeDefinition>,
    order: Vec<NodeId>,
    edges: Vec<Edge>,
    start: Option<NodeId>,
    ends: Vec<NodeId>,
    cursor: Option<NodeId>,
    branches: Vec<BranchFrame>,
    parallel_groups: HashMap<NodeId, ParallelConfig>,
    /// Parallel group whose branches have not been joined yet.
    fan_out: Option<NodeId>,
    error_handler: Option<ErrorHandler>,
    counter: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `node` as the entry point and move the cursor to it.
    pub fn start(mut self, node: NodeDefinition) -> Result<Self> {
        if let Some(existing) = &self.start {
            return Err(WaypointError::DuplicateStart {
                existing: existing.clone(),
                attempted: node.id,
            });
        }
        let id = node.id.clone();
        self.register(node)?;
        self.start = Some(id.clone());
        self.cursor = Some(id);
        Ok(self)
    }

    /// Register `node` and wire it after the cursor.
    ///
    /// With no cursor the node becomes the first node of the open branch, or
    /// the start node if there is none yet.
    pub fn then(mut self, node: NodeDefinition) -> Result<Self> {
        self.check_fan_out()?;
        let id = node.id.clone();
        self.register(node)?;
        self.attach(id);
        Ok(self)
    }

    /// Register a node without wiring it.
    pub fn add_node(mut self, node: NodeDefinition) -> Result<Self> {
        self.register(node)?;
        Ok(self)
    }

    pub fn edge(mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.edges.push(Edge::always(from, to));
        self
    }

    pub fn conditional_edge(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        condition: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.edges.push(Edge::when(from, to, Arc::new(condition)));
        self
    }

    /// Push a prebuilt edge, e.g. `Edge::when(..).with_label("retry")`.
    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Edge guarded by a `key == "value"` style expression.
    pub fn expr_edge(
        mut self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        expr: impl Into<String>,
    ) -> Self {
        self.edges.push(Edge::conditional(from, to, expr));
        self
    }

    /// Open a conditional branch.
    pub fn if_(self, condition: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static) -> Result<Self> {
        self.open_branch(Arc::new(condition))
    }

    pub fn else_(mut self) -> Result<Self> {
        self.check_fan_out()?;
        let cursor = self.cursor.take();
        let frame = self.branches.last_mut().ok_or(WaypointError::ElseWithoutIf)?;
        if frame.in_else {
            return Err(WaypointError::DuplicateElse);
        }
        frame.then_end = cursor;
        frame.in_else = true;
        Ok(self)
    }

    /// Close the innermost branch; both arms converge on a merge node.
    pub fn endif(mut self) -> Result<Self> {
        self.check_fan_out()?;
        let frame = self.branches.pop().ok_or(WaypointError::EndifWithoutIf)?;
        let branch_end = self.cursor.take();
        let (then_end, else_end) = if frame.in_else {
            (frame.then_end.clone(), branch_end)
        } else {
            (branch_end, None)
        };

        let merge_id = format!("{}_merge", frame.decision);
        self.register(NodeDefinition::new(merge_id.clone(), NodeKind::Decision, |_ctx| async {
            Ok(NodeResult::new())
        }))?;

        let condition = Arc::clone(&frame.condition);
        let negated: Condition = Arc::new(move |s: &WorkflowState| !condition(s));
        let then_target = frame.then_start.clone().unwrap_or_else(|| merge_id.clone());
        let else_target = frame.else_start.clone().unwrap_or_else(|| merge_id.clone());
        self.edges.push(
            Edge::when(frame.decision.clone(), then_target, Arc::clone(&frame.condition))
                .with_label(LABEL_IF_TRUE),
        );
        self.edges
            .push(Edge::when(frame.decision.clone(), else_target, negated).with_label(LABEL_IF_FALSE));

        for end in [then_end, else_end].into_iter().flatten() {
            self.edges.push(Edge::always(end, merge_id.clone()));
        }

        self.cursor = Some(merge_id);
        Ok(self)
    }

    /// Expand an if/else-if/else chain into nested branches.
    pub fn if_chain(mut self, chain: IfConfig) -> Result<Self> {
        let mut arms = chain.branches.into_iter();
        let Some((condition, body)) = arms.next() else {
            for node in chain.otherwise.unwrap_or_default() {
                self = self.then(node)?;
            }
            return Ok(self);
        };

        self = self.open_branch(condition)?;
        for node in body {
            self = self.then(node)?;
        }

        let rest = IfConfig {
            branches: arms.collect(),
            otherwise: chain.otherwise,
        };
        if !rest.branches.is_empty() || rest.otherwise.is_some() {
            self = self.else_()?.if_chain(rest)?;
        }
        self.endif()
    }

    /// Fan out to existing or later-added branch nodes.
    ///
    /// Branches are not joined automatically: wire them onward with
    /// [`edge`](Self::edge), or chain on with [`join`](Self::join). Until
    /// then the cursor is cleared and chaining methods return
    /// [`WaypointError::UnjoinedParallel`].
    pub fn parallel(mut self, config: ParallelConfig) -> Result<Self> {
        let id = config.id.clone();
        self = self.then(parallel_node(&config))?;
        for branch in &config.branches {
            self.edges
                .push(Edge::always(id.clone(), branch.clone()).with_label(LABEL_PARALLEL_BRANCH));
        }
        self.parallel_groups.insert(id.clone(), config);
        self.cursor = None;
        self.fan_out = Some(id);
        Ok(self)
    }

    /// Wire every branch of the open parallel group into `node` and move the
    /// cursor to it. Without an open group this is [`then`](Self::then).
    pub fn join(mut self, node: NodeDefinition) -> Result<Self> {
        let Some(group) = self.fan_out.take() else {
            return self.then(node);
        };
        let id = node.id.clone();
        self.register(node)?;
        let branches = self
            .parallel_groups
            .get(&group)
            .map(|config| config.branches.clone())
            .unwrap_or_default();
        for branch in branches {
            self.edges.push(Edge::always(branch, id.clone()));
        }
        self.cursor = Some(id);
        Ok(self)
    }

    /// Run `body` in order until `until` holds or `max_iterations` passes are done.
    ///
    /// `until` is checked after each pass.
    pub fn loop_(
        mut self,
        body: Vec<NodeDefinition>,
        until: impl Fn(&WorkflowState) -> bool + Send + Sync + 'static,
        max_iterations: u64,
    ) -> Result<Self> {
        let Some(first) = body.first().map(|n| n.id.clone()) else {
            return Err(WaypointError::EmptyLoop);
        };
        let n = self.next_seq();
        let start_id = format!("loop_{n}_start");
        let check_id = format!("loop_{n}_check");

        let seed_id = check_id.clone();
        let mut start = NodeDefinition::new(start_id, NodeKind::Decision, move |_ctx: ExecutionContext| {
            let seed_id = seed_id.clone();
            async move {
                Ok(NodeResult::from_update(
                    StateUpdate::new().output(seed_id, json!({ "iteration": 0 })),
                ))
            }
        });
        start.is_loop_node = true;
        self = self.then(start)?;

        for mut node in body {
            node.is_loop_node = true;
            self = self.then(node)?;
        }

        let until: Condition = Arc::new(until);
        let keep_going: Condition = {
            let check_id = check_id.clone();
            let until = Arc::clone(&until);
            Arc::new(move |s: &WorkflowState| {
                iteration(s, &check_id) < max_iterations && !until(s)
            })
        };

        let decide = Arc::clone(&keep_going);
        let body_start = first.clone();
        let mut check = NodeDefinition::new(check_id.clone(), NodeKind::Decision, move |ctx: ExecutionContext| {
            let decide = Arc::clone(&decide);
            let body_start = body_start.clone();
            async move {
                let pass = iteration(&ctx.state, &ctx.node_id) + 1;
                let update = StateUpdate::new().output(ctx.node_id.clone(), json!({ "iteration": pass }));
                let again = decide(&merge_state(&ctx.state, &update));
                debug!(node_id = %ctx.node_id, iteration = pass, again, "Loop pass finished");
                let result = NodeResult::from_update(update);
                Ok(if again { result.goto(body_start) } else { result })
            }
        });
        check.is_loop_node = true;
        self = self.then(check)?;

        self.edges
            .push(Edge::when(check_id, first, keep_going).with_label(LABEL_LOOP_CONTINUE));
        Ok(self)
    }

    /// Insert a pause for host input, unless the wait is auto-approved.
    pub fn wait(mut self, step: impl Into<WaitStep>) -> Result<Self> {
        match step.into() {
            WaitStep::Node(node) => self.then(node),
            WaitStep::Config(config) if config.auto_approve => Ok(self),
            WaitStep::Config(config) => {
                let id = format!("wait_{}", self.next_seq());
                self.then(wait_node(id, config))
            }
        }
    }

    pub fn tool(self, config: ToolNodeConfig) -> Result<Self> {
        self.then(tool_node(config))
    }

    pub fn subagent(self, config: SubagentConfig) -> Result<Self> {
        self.then(subagent_node(config))
    }

    pub fn parallel_subagents(self, config: ParallelSubagentConfig) -> Result<Self> {
        let node = parallel_subagent_node(config)?;
        self.then(node)
    }

    /// Graph-level error handler, used for nodes without their own.
    pub fn catch(
        mut self,
        handler: impl Fn(&WaypointError, &WorkflowState, u32) -> ErrorAction + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Mark the cursor node as an end node.
    pub fn end(mut self) -> Self {
        if let Some(cursor) = self.cursor.clone() {
            self.mark_end(cursor);
        }
        self
    }

    /// Mark any node as an end node.
    pub fn end_at(mut self, id: impl Into<NodeId>) -> Self {
        self.mark_end(id.into());
        self
    }

    /// Validate and freeze the graph.
    ///
    /// Without explicit `end` calls, every node with no outgoing edge is an end node.
    pub fn compile(self, config: GraphConfig) -> Result<CompiledGraph> {
        if !self.branches.is_empty() {
            return Err(WaypointError::UnclosedBranch(self.branches.len()));
        }
        let start = self.start.ok_or(WaypointError::MissingStart)?;

        for edge in &self.edges {
            for id in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(id) {
                    return Err(WaypointError::UnknownNode(id.clone()));
                }
            }
        }
        if let Some(missing) = self.ends.iter().find(|id| !self.nodes.contains_key(*id)) {
            return Err(WaypointError::UnknownNode(missing.clone()));
        }

        let ends = if self.ends.is_empty() {
            self.order
                .iter()
                .filter(|id| !self.edges.iter().any(|e| &e.from == *id))
                .cloned()
                .collect()
        } else {
            self.ends
        };

        debug!(
            nodes = self.order.len(),
            edges = self.edges.len(),
            start = %start,
            "Graph compiled"
        );

        Ok(CompiledGraph {
            nodes: self.nodes,
            order: self.order,
            edges: self.edges,
            start,
            ends,
            parallel_groups: self.parallel_groups,
            error_handler: self.error_handler,
            config,
        })
    }

    fn register(&mut self, node: NodeDefinition) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(WaypointError::DuplicateNode(node.id));
        }
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn check_fan_out(&self) -> Result<()> {
        match &self.fan_out {
            Some(group) => Err(WaypointError::UnjoinedParallel(group.clone())),
            None => Ok(()),
        }
    }

    fn attach(&mut self, id: NodeId) {
        match self.cursor.take() {
            Some(prev) => self.edges.push(Edge::always(prev, id.clone())),
            None => {
                if let Some(frame) = self.branches.last_mut() {
                    let slot = if frame.in_else {
                        &mut frame.else_start
                    } else {
                        &mut frame.then_start
                    };
                    slot.get_or_insert_with(|| id.clone());
                } else if self.start.is_none() {
                    self.start = Some(id.clone());
                }
            }
        }
        self.cursor = Some(id);
    }

    fn open_branch(mut self, condition: Condition) -> Result<Self> {
        let id = format!("if_{}", self.next_seq());
        let evaluate = Arc::clone(&condition);
        let decision = NodeDefinition::new(id.clone(), NodeKind::Decision, move |ctx: ExecutionContext| {
            let taken = evaluate(&ctx.state);
            async move {
                let branch = if taken { "then" } else { "else" };
                Ok(NodeResult::from_update(
                    StateUpdate::new().output(ctx.node_id.clone(), json!({ "branch": branch })),
                ))
            }
        });
        self = self.then(decision)?;
        self.cursor = None;
        self.branches.push(BranchFrame {
            decision: id,
            condition,
            then_start: None,
            then_end: None,
            else_start: None,
            in_else: false,
        });
        Ok(self)
    }

    fn mark_end(&mut self, id: NodeId) {
        if !self.ends.contains(&id) {
            self.ends.push(id);
        }
    }

    fn next_seq(&mut self) -> usize {
        self.counter += 1;
        self.counter
    }
}

fn iteration(state: &WorkflowState, check_id: &str) -> u64 {
    state
        .output(check_id)
        .and_then(|v| v.get("iteration"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &str) -> NodeDefinition {
        NodeDefinition::new(id, NodeKind::Tool, |_ctx| async { Ok(NodeResult::new()) })
    }

    fn labels(graph: &CompiledGraph, from: &str) -> Vec<(String, Option<String>)> {
        graph
            .outgoing(from)
            .map(|e| (e.to.clone(), e.label.clone()))
            .collect()
    }

    #[test]
    fn test_linear_chain() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .then(noop("b"))
            .unwrap()
            .then(noop("c"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(graph.start_node(), "a");
        assert_eq!(graph.edges().len(), 2);
        assert_eq!(graph.end_nodes(), &["c".to_string()]);
        assert_eq!(graph.next_nodes("a", &WorkflowState::new("x")), vec!["b"]);
    }

    #[test]
    fn test_then_without_start_becomes_start() {
        let graph = GraphBuilder::new()
            .then(noop("a"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();
        assert_eq!(graph.start_node(), "a");
    }

    #[test]
    fn test_build_errors() {
        let err = GraphBuilder::new().start(noop("a")).unwrap().then(noop("a")).err().unwrap();
        assert!(matches!(err, WaypointError::DuplicateNode(id) if id == "a"));

        let err = GraphBuilder::new().start(noop("a")).unwrap().start(noop("b")).err().unwrap();
        assert!(matches!(err, WaypointError::DuplicateStart { .. }));

        let err = GraphBuilder::new().add_node(noop("a")).unwrap().compile(GraphConfig::default()).unwrap_err();
        assert!(matches!(err, WaypointError::MissingStart));

        assert!(matches!(GraphBuilder::new().else_().err().unwrap(), WaypointError::ElseWithoutIf));
        assert!(matches!(GraphBuilder::new().endif().err().unwrap(), WaypointError::EndifWithoutIf));

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|_| true)
            .unwrap()
            .else_()
            .unwrap()
            .else_()
            .err()
            .unwrap();
        assert!(matches!(err, WaypointError::DuplicateElse));

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|_| true)
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap_err();
        assert!(matches!(err, WaypointError::UnclosedBranch(1)));

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .loop_(vec![], |_| true, 3)
            .err()
            .unwrap();
        assert!(matches!(err, WaypointError::EmptyLoop));

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .edge("a", "ghost")
            .compile(GraphConfig::default())
            .unwrap_err();
        assert!(matches!(err, WaypointError::UnknownNode(id) if id == "ghost"));
    }

    #[test]
    fn test_chaining_after_parallel_requires_join() {
        let fan = || ParallelConfig::new("fan", vec!["left".into(), "right".into()]);

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .parallel(fan())
            .unwrap()
            .then(noop("after"))
            .err()
            .unwrap();
        assert!(matches!(err, WaypointError::UnjoinedParallel(id) if id == "fan"));

        let err = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|_| true)
            .unwrap()
            .parallel(fan())
            .unwrap()
            .endif()
            .err()
            .unwrap();
        assert!(matches!(err, WaypointError::UnjoinedParallel(_)));

        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .parallel(fan())
            .unwrap()
            .add_node(noop("left"))
            .unwrap()
            .add_node(noop("right"))
            .unwrap()
            .join(noop("join"))
            .unwrap()
            .then(noop("after"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(labels(&graph, "left"), vec![("join".to_string(), None)]);
        assert_eq!(labels(&graph, "right"), vec![("join".to_string(), None)]);
        assert_eq!(labels(&graph, "join"), vec![("after".to_string(), None)]);
        assert_eq!(graph.end_nodes(), &["after".to_string()]);
    }

    #[test]
    fn test_if_else_shape() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|s| s.get_bool("ok") == Some(true))
            .unwrap()
            .then(noop("yes"))
            .unwrap()
            .else_()
            .unwrap()
            .then(noop("no"))
            .unwrap()
            .endif()
            .unwrap()
            .then(noop("done"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(
            labels(&graph, "if_1"),
            vec![
                ("yes".to_string(), Some(LABEL_IF_TRUE.to_string())),
                ("no".to_string(), Some(LABEL_IF_FALSE.to_string())),
            ]
        );
        assert_eq!(labels(&graph, "yes"), vec![("if_1_merge".to_string(), None)]);
        assert_eq!(labels(&graph, "no"), vec![("if_1_merge".to_string(), None)]);
        assert_eq!(graph.end_nodes(), &["done".to_string()]);

        let state = WorkflowState::new("x").with_field("ok", json!(false));
        assert_eq!(graph.next_nodes("if_1", &state), vec!["no"]);
    }

    #[test]
    fn test_if_without_else_routes_false_to_merge() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|_| false)
            .unwrap()
            .then(noop("yes"))
            .unwrap()
            .endif()
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();
        assert_eq!(graph.next_nodes("if_1", &WorkflowState::new("x")), vec!["if_1_merge"]);
        assert_eq!(graph.end_nodes(), &["if_1_merge".to_string()]);
    }

    #[test]
    fn test_if_chain_matches_nested_branches() {
        let chained = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_chain(
                IfConfig::new()
                    .when(|s| s.get_i64("n") == Some(1), vec![noop("one")])
                    .when(|s| s.get_i64("n") == Some(2), vec![noop("two")])
                    .otherwise(vec![noop("many")]),
            )
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        let nested = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .if_(|s| s.get_i64("n") == Some(1))
            .unwrap()
            .then(noop("one"))
            .unwrap()
            .else_()
            .unwrap()
            .if_(|s| s.get_i64("n") == Some(2))
            .unwrap()
            .then(noop("two"))
            .unwrap()
            .else_()
            .unwrap()
            .then(noop("many"))
            .unwrap()
            .endif()
            .unwrap()
            .endif()
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(chained.structure(), nested.structure());
    }

    #[test]
    fn test_parallel_records_group() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .parallel(ParallelConfig::new("fan", vec!["left".into(), "right".into()]))
            .unwrap()
            .add_node(noop("left"))
            .unwrap()
            .add_node(noop("right"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert!(graph.parallel_group("fan").is_some());
        assert_eq!(
            labels(&graph, "fan"),
            vec![
                ("left".to_string(), Some(LABEL_PARALLEL_BRANCH.to_string())),
                ("right".to_string(), Some(LABEL_PARALLEL_BRANCH.to_string())),
            ]
        );
        assert_eq!(graph.end_nodes(), &["left".to_string(), "right".to_string()]);
    }

    #[test]
    fn test_loop_tags_nodes() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .loop_(vec![noop("body")], |_| false, 3)
            .unwrap()
            .then(noop("after"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();

        assert!(graph.node("body").unwrap().is_loop_node());
        assert!(graph.node("loop_1_check").unwrap().is_loop_node());
        assert!(!graph.node("a").unwrap().is_loop_node());
        assert_eq!(
            labels(&graph, "loop_1_check"),
            vec![
                ("body".to_string(), Some(LABEL_LOOP_CONTINUE.to_string())),
                ("after".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_wait_auto_approve_inserts_nothing() {
        let builder = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .wait(WaitConfig::new("ok?").auto_approve(true))
            .unwrap()
            .wait("Approve?")
            .unwrap();
        let graph = builder.compile(GraphConfig::default()).unwrap();
        assert_eq!(graph.nodes().count(), 2);
        assert_eq!(graph.node("wait_1").unwrap().kind, NodeKind::Wait);
    }

    #[test]
    fn test_explicit_end() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .end()
            .then(noop("b"))
            .unwrap()
            .compile(GraphConfig::default())
            .unwrap();
        assert_eq!(graph.end_nodes(), &["a".to_string()]);
        assert!(graph.is_end("a"));
    }

    #[test]
    fn test_labelled_conditional_edge() {
        let graph = GraphBuilder::new()
            .start(noop("a"))
            .unwrap()
            .add_node(noop("retry"))
            .unwrap()
            .add_edge(
                Edge::when("a", "retry", Arc::new(|s: &WorkflowState| s.get_bool("again") == Some(true)))
                    .with_label("again"),
            )
            .compile(GraphConfig::default())
            .unwrap();

        assert_eq!(labels(&graph, "a"), vec![("retry".to_string(), Some("again".to_string()))]);
        let state = WorkflowState::new("x").with_field("again", json!(true));
        assert_eq!(graph.next_nodes("a", &state), vec!["retry"]);
        assert!(graph.next_nodes("a", &WorkflowState::new("x")).is_empty());
    }
}
