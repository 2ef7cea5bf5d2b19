use thiserror::Error;

#[derive(Debug, Error)]
pub enum WaypointError {
    // Build errors
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Start node already set to '{existing}', cannot set '{attempted}'")]
    DuplicateStart { existing: String, attempted: String },

    #[error("Graph has no start node")]
    MissingStart,

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("else() called without an open if()")]
    ElseWithoutIf,

    #[error("else() called twice for the same if()")]
    DuplicateElse,

    #[error("endif() called without an open if()")]
    EndifWithoutIf,

    #[error("{0} conditional branch(es) left open at compile time")]
    UnclosedBranch(usize),

    #[error("Loop body is empty")]
    EmptyLoop,

    #[error("Parallel group '{0}' has no join; call join() before chaining more nodes")]
    UnjoinedParallel(String),

    #[error("Invalid node configuration for '{node}': {message}")]
    InvalidNode { node: String, message: String },

    // Node execution errors
    #[error("Node execution failed: {0}")]
    NodeExecution(String),

    #[error("Operation timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("No {kind} registered for '{name}'")]
    ProviderNotFound { kind: String, name: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Sub-agent failed: {agent}: {message}")]
    SubAgent { agent: String, message: String },

    #[error("Subgraph failed: {0}")]
    Subgraph(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Validation errors
    #[error("Schema validation failed: {0}")]
    SchemaValidation(String),

    // Wrapper so every failure is attributable to a node
    #[error("Node '{node}' failed: {source}")]
    Node {
        node: String,
        #[source]
        source: Box<WaypointError>,
    },

    // Step budget
    #[error("Execution exceeded max steps ({0})")]
    MaxStepsExceeded(usize),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WaypointError {
    /// Attach the failing node's id. Already-wrapped errors are left alone.
    pub fn in_node(self, node: impl Into<String>) -> Self {
        match self {
            wrapped @ WaypointError::Node { .. } => wrapped,
            other => WaypointError::Node {
                node: node.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with any node wrappers peeled off.
    pub fn root(&self) -> &WaypointError {
        match self {
            WaypointError::Node { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this is a build-time error (never retried).
    pub fn is_build_error(&self) -> bool {
        matches!(
            self.root(),
            WaypointError::DuplicateNode(_)
                | WaypointError::DuplicateStart { .. }
                | WaypointError::MissingStart
                | WaypointError::ElseWithoutIf
                | WaypointError::DuplicateElse
                | WaypointError::EndifWithoutIf
                | WaypointError::UnclosedBranch(_)
                | WaypointError::EmptyLoop
                | WaypointError::UnjoinedParallel(_)
                | WaypointError::InvalidNode { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), WaypointError::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), WaypointError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, WaypointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_node_wraps_once() {
        let err = WaypointError::ToolNotFound("search".into())
            .in_node("fetch")
            .in_node("outer");
        match &err {
            WaypointError::Node { node, .. } => assert_eq!(node, "fetch"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(err.root(), WaypointError::ToolNotFound(_)));
        assert_eq!(err.to_string(), "Node 'fetch' failed: Tool not found: search");
    }

    #[test]
    fn test_classification() {
        assert!(WaypointError::MissingStart.is_build_error());
        assert!(!WaypointError::NodeExecution("x".into()).is_build_error());

        let timeout = WaypointError::Timeout {
            operation: "tool".into(),
            timeout_ms: 10,
        }
        .in_node("t");
        assert!(timeout.is_timeout());
        assert!(WaypointError::Cancelled.in_node("a").is_cancelled());
    }
}
