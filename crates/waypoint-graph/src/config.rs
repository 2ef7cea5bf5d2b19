use std::fmt;
use std::sync::Arc;

use waypoint_core::config::EngineConfig;
use waypoint_core::event::ProgressCallback;
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::ModelHint;

use crate::retry::RetryPolicy;
use crate::runtime::RuntimeDeps;

/// Settings a compiled graph runs with.
#[derive(Clone)]
pub struct GraphConfig {
    pub max_steps: usize,
    pub default_model: Option<ModelHint>,
    /// Context-window usage percentage treated as a breach.
    pub context_window_threshold: f64,
    /// Policy for nodes without their own.
    pub retry: RetryPolicy,
    pub checkpointer: Option<Arc<dyn CheckpointSink>>,
    /// Persist after every node, not only on checkpoint signals.
    pub auto_checkpoint: bool,
    pub on_progress: Option<ProgressCallback>,
    pub runtime: RuntimeDeps,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self::from_engine(&EngineConfig::default())
    }
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConfig")
            .field("max_steps", &self.max_steps)
            .field("default_model", &self.default_model)
            .field("context_window_threshold", &self.context_window_threshold)
            .field("retry", &self.retry)
            .field("checkpointer", &self.checkpointer.is_some())
            .field("auto_checkpoint", &self.auto_checkpoint)
            .field("on_progress", &self.on_progress.is_some())
            .finish_non_exhaustive()
    }
}

impl GraphConfig {
    /// Build from the `[executor]` and `[retry]` sections of an engine config.
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            max_steps: config.executor.max_steps,
            default_model: config.executor.default_model.as_deref().map(ModelHint::parse),
            context_window_threshold: config.executor.context_window_threshold,
            retry: RetryPolicy::from_config(&config.retry),
            checkpointer: None,
            auto_checkpoint: config.executor.auto_checkpoint,
            on_progress: None,
            runtime: RuntimeDeps::default(),
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_default_model(mut self, model: impl AsRef<str>) -> Self {
        self.default_model = Some(ModelHint::parse(model.as_ref()));
        self
    }

    pub fn with_context_window_threshold(mut self, pct: f64) -> Self {
        self.context_window_threshold = pct;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_checkpointer(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpointer = Some(sink);
        self
    }

    pub fn with_auto_checkpoint(mut self, enabled: bool) -> Self {
        self.auto_checkpoint = enabled;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeDeps) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_engine() {
        let engine = EngineConfig::from_toml(
            r#"
[executor]
max_steps = 50
default_model = "inherit"
context_window_threshold = 65.0

[retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = GraphConfig::from_engine(&engine);
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.default_model, Some(ModelHint::Inherit));
        assert_eq!(config.context_window_threshold, 65.0);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.checkpointer.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = GraphConfig::default().with_default_model("sonnet");
        assert_eq!(config.max_steps, 1000);
        assert_eq!(config.context_window_threshold, 80.0);
        assert_eq!(config.default_model, Some(ModelHint::Explicit("sonnet".into())));
        assert!(!config.auto_checkpoint);
    }
}
