use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WaypointError};

/// Top-level engine configuration, loaded from `waypoint.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Traversal limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum node executions per run. Default: 1000
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Default model for nodes that do not name one (`"inherit"` allowed).
    #[serde(default)]
    pub default_model: Option<String>,
    /// Context-window usage percentage treated as a breach. Default: 80
    #[serde(default = "default_context_window_threshold")]
    pub context_window_threshold: f64,
    /// Persist a checkpoint after every node. Default: false
    #[serde(default)]
    pub auto_checkpoint: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            default_model: None,
            context_window_threshold: default_context_window_threshold(),
            auto_checkpoint: false,
        }
    }
}

fn default_max_steps() -> usize { 1000 }
fn default_context_window_threshold() -> f64 { 80.0 }

/// Per-node retry defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff delay (none = unbounded).
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    /// Randomize each delay by 0.8x to 1.2x.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: None,
            jitter: false,
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

/// Checkpoint persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Enable the SQLite checkpoint sink (default: true when section is present).
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// Path of the SQLite database. Default: ~/.waypoint/checkpoints.db
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_checkpoint_path(),
        }
    }
}

impl CheckpointConfig {
    /// Resolve the database path (expand ~).
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_checkpoint_enabled() -> bool { true }
fn default_checkpoint_path() -> String { "~/.waypoint/checkpoints.db".to_string() }

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when RUST_LOG is unset (default: "info").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WaypointError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WaypointError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_steps == 0 {
            return Err(WaypointError::Config("executor.max_steps must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(WaypointError::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(WaypointError::Config(
                "retry.backoff_multiplier must be >= 1.0".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.executor.context_window_threshold) {
            return Err(WaypointError::Config(
                "executor.context_window_threshold must be within 0..=100".into(),
            ));
        }
        Ok(())
    }
}

/// Substitute `${NAME}` with the value of the environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let placeholder = &rest[open..];
        let Some(close) = placeholder.find('}') else {
            out.push_str(placeholder);
            return out;
        };
        let name = &placeholder[2..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&placeholder[..=close]),
        }
        rest = &placeholder[close + 1..];
    }
    out.push_str(rest);
    out
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
