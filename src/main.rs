mod demo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::EngineConfig;
use waypoint_core::event::{ProgressBus, ProgressCallback};
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::{ExecutionStatus, Signal};
use waypoint_graph::{
    ExecutionOptions, GraphConfig, GraphExecutor, SqliteCheckpointSink, StepResult, StreamEvent,
    StreamMode, StreamRouter,
};

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Resumable workflow graphs for agent pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "waypoint.toml", env = "WAYPOINT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the resolved configuration
    Config,
    /// Run the bundled release-notes workflow
    Demo {
        /// Topic stored in the initial state
        #[arg(long, default_value = "waypoint")]
        topic: String,
        /// Skip the approval pause
        #[arg(long)]
        auto_approve: bool,
        /// Execution ID (auto-generated if not provided)
        #[arg(long)]
        execution_id: Option<String>,
        /// Stream modes to print (values, updates, events, debug)
        #[arg(long, value_delimiter = ',', default_value = "updates")]
        stream: Vec<String>,
    },
    /// Resume a paused demo run from its last checkpoint
    Resume {
        execution_id: String,
        /// Resume input, as JSON or plain text
        #[arg(long)]
        input: Option<String>,
        /// Checkpoint label (latest if omitted)
        #[arg(long)]
        label: Option<String>,
    },
    /// Print the demo workflow as a Mermaid flowchart
    Graph,
    /// Inspect persisted checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List executions, or the labels saved for one execution
    List { execution_id: Option<String> },
    /// Print a checkpoint as JSON
    Show {
        execution_id: String,
        #[arg(long)]
        label: Option<String>,
    },
    /// Delete one checkpoint, or all of an execution's checkpoints
    Delete {
        execution_id: String,
        #[arg(long)]
        label: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waypoint", &mut std::io::stdout());
        return Ok(());
    }

    let (config, source) = load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .with_target(false)
        .init();

    match &source {
        Some(path) => info!(path = %path.display(), "Loaded config"),
        None => info!("No config file found, using defaults"),
    }

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Graph => {
            let graph = demo::release_graph(GraphConfig::from_engine(&config), false)?;
            println!("{}", graph.to_mermaid());
        }
        Commands::Demo {
            topic,
            auto_approve,
            execution_id,
            stream,
        } => {
            let modes = parse_modes(&stream)?;
            let mut graph_config = GraphConfig::from_engine(&config).with_progress(progress_logger());
            match open_sink(&config)? {
                Some(sink) => graph_config = graph_config.with_checkpointer(sink),
                None => warn!("Checkpointing disabled, a paused run cannot be resumed"),
            }
            let graph = demo::release_graph(graph_config, auto_approve)?;

            let mut options = ExecutionOptions::new()
                .with_field("topic", Value::String(topic))
                .with_cancel(ctrl_c_token());
            if let Some(id) = execution_id {
                options = options.with_execution_id(id);
            }
            run_printing(GraphExecutor::new(graph), options, &modes).await?;
        }
        Commands::Resume {
            execution_id,
            input,
            label,
        } => {
            let sink = open_sink(&config)?
                .ok_or_else(|| anyhow::anyhow!("checkpointing is disabled in {}", cli.config.display()))?;
            let snapshot = sink
                .load(&execution_id, label.as_deref())
                .await?
                .ok_or_else(|| anyhow::anyhow!("no checkpoint for execution '{execution_id}'"))?;
            if snapshot.status.is_terminal() {
                anyhow::bail!("execution '{execution_id}' already finished ({})", snapshot.status);
            }

            let graph = demo::release_graph(
                GraphConfig::from_engine(&config)
                    .with_checkpointer(sink)
                    .with_progress(progress_logger()),
                false,
            )?;
            let mut options = ExecutionOptions::resume(snapshot).with_cancel(ctrl_c_token());
            if let Some(raw) = input {
                options = options.with_resume_input(parse_input(&raw));
            }
            run_printing(GraphExecutor::new(graph), options, &[StreamMode::Updates]).await?;
        }
        Commands::Checkpoints { action } => {
            let sink = open_sink(&config)?
                .ok_or_else(|| anyhow::anyhow!("checkpointing is disabled in {}", cli.config.display()))?;
            handle_checkpoints(&sink, action).await?;
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the given config file, falling back to `~/.waypoint/config.toml`, then defaults.
fn load_config(path: &Path) -> anyhow::Result<(EngineConfig, Option<PathBuf>)> {
    if path.exists() {
        return Ok((EngineConfig::load(path)?, Some(path.to_path_buf())));
    }
    if let Some(home) = dirs_home().map(|h| h.join(".waypoint").join("config.toml")) {
        if home.exists() {
            return Ok((EngineConfig::load(&home)?, Some(home)));
        }
    }
    Ok((EngineConfig::default(), None))
}

fn open_sink(config: &EngineConfig) -> anyhow::Result<Option<Arc<SqliteCheckpointSink>>> {
    if !config.checkpoint.enabled {
        return Ok(None);
    }
    let path = config.checkpoint.resolved_path();
    let sink = SqliteCheckpointSink::open(&path)?;
    info!(path = %path.display(), "Checkpoint store opened");
    Ok(Some(Arc::new(sink)))
}

/// Cancelled on the first Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });
    token
}

/// Logs progress events from a background subscriber.
fn progress_logger() -> ProgressCallback {
    let bus = Arc::new(ProgressBus::default());
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match &event.error {
                    Some(error) => warn!(node_id = %event.node_id, kind = ?event.kind, error = %error, "Progress"),
                    None => debug!(node_id = %event.node_id, kind = ?event.kind, "Progress"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Progress subscriber lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    bus.callback()
}

fn parse_modes(raw: &[String]) -> anyhow::Result<Vec<StreamMode>> {
    raw.iter()
        .map(|m| StreamMode::parse(m.trim()).ok_or_else(|| anyhow::anyhow!("unknown stream mode '{m}'")))
        .collect()
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_printing(
    executor: GraphExecutor,
    options: ExecutionOptions,
    modes: &[StreamMode],
) -> anyhow::Result<()> {
    let router = StreamRouter::new(modes.iter().copied());
    let mut steps = executor.stream(options);
    let mut last: Option<StepResult> = None;

    while let Some(step) = steps.next().await {
        for event in router.route(&step) {
            print_event(&event)?;
        }
        last = Some(step);
    }

    let Some(last) = last else {
        anyhow::bail!("run produced no steps");
    };
    let execution_id = &last.snapshot.execution_id;
    match last.status {
        ExecutionStatus::Paused => {
            let prompt = last
                .signals
                .iter()
                .find_map(|s| match s {
                    Signal::PauseForInput { prompt, .. } => Some(prompt.as_str()),
                    _ => None,
                })
                .unwrap_or("input required");
            println!("Paused: {prompt}");
            println!("Resume with: waypoint resume {execution_id} --input <answer>");
        }
        ExecutionStatus::Completed => println!("Execution {execution_id} completed"),
        status => {
            let reason = last
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| status.to_string());
            anyhow::bail!("execution {execution_id} ended {status}: {reason}");
        }
    }
    Ok(())
}

fn print_event(event: &StreamEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}

async fn handle_checkpoints(
    sink: &SqliteCheckpointSink,
    action: CheckpointAction,
) -> anyhow::Result<()> {
    match action {
        CheckpointAction::List { execution_id: None } => {
            let executions = sink.executions()?;
            if executions.is_empty() {
                println!("No checkpoints stored.");
            }
            for id in executions {
                let status = sink
                    .load(&id, None)
                    .await?
                    .map(|s| s.status.to_string())
                    .unwrap_or_default();
                println!("  {id:<40} {status}");
            }
        }
        CheckpointAction::List {
            execution_id: Some(id),
        } => {
            for label in sink.list(&id).await? {
                println!("  {label}");
            }
        }
        CheckpointAction::Show { execution_id, label } => {
            match sink.load(&execution_id, label.as_deref()).await? {
                Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                None => anyhow::bail!("no checkpoint for execution '{execution_id}'"),
            }
        }
        CheckpointAction::Delete { execution_id, label } => {
            let removed = sink.delete(&execution_id, label.as_deref()).await?;
            println!("Deleted {removed} checkpoint(s).");
        }
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
