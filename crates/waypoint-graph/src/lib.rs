//! Graph construction and execution for agent workflows.
//!
//! Build a graph with [`GraphBuilder`], compile it into a [`CompiledGraph`],
//! then drive it with [`GraphExecutor`], either step by step through
//! [`GraphExecutor::stream`] or to completion with [`GraphExecutor::execute`].

pub mod builder;
pub mod checkpoint;
pub mod compiled;
pub mod config;
pub mod edge;
pub mod executor;
pub mod node;
pub mod nodes;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod state;
pub mod stream;
pub mod tools;

pub use builder::{GraphBuilder, IfConfig, WaitStep};
pub use checkpoint::{MemoryCheckpointSink, SqliteCheckpointSink};
pub use compiled::{CompiledGraph, EdgeOutline, GraphStructure};
pub use config::GraphConfig;
pub use edge::{condition, evaluate_condition, Condition, Edge, EdgeCondition};
pub use executor::{ExecutionOptions, ExecutionOutcome, GraphExecutor, StepResult};
pub use node::{EventEmitter, ExecutionContext, NodeDefinition, NodeResult, Prompt};
pub use nodes::WaitConfig;
pub use retry::{ErrorAction, ErrorHandler, RetryPolicy};
pub use runtime::{RuntimeDeps, WorkflowResolver};
pub use state::{init_state, merge_state, without_reserved};
pub use stream::{route_stream, DebugInfo, StreamEvent, StreamMode, StreamRouter};
pub use tools::{ToolDefinition, ToolRegistry};
