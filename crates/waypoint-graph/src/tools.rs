use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::state::WorkflowState;
use waypoint_core::traits::Tool;

use crate::schema;

/// Name, description and input schema of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Registry of custom tools available to custom-tool nodes.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: impl Tool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Validate `input` against the tool's schema and execute it.
    pub async fn execute(
        &self,
        name: &str,
        input: Value,
        state: Arc<WorkflowState>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| WaypointError::ToolNotFound(name.to_string()))?;

        schema::validate(&tool.input_schema(), &input, &format!("tool '{name}' input"))?;

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(input, state)).await {
                Ok(result) => result,
                Err(_) => Err(WaypointError::Timeout {
                    operation: format!("tool '{name}'"),
                    timeout_ms: limit.as_millis() as u64,
                }),
            },
            None => tool.execute(input, state).await,
        }
    }
}
