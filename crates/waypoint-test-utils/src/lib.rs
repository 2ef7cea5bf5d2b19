//! Mocks and fixtures shared by the Waypoint test suites.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Map, Value};

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::event::{ProgressCallback, ProgressEvent, ProgressKind};
use waypoint_core::state::WorkflowState;
use waypoint_core::traits::{
    AgentSession, AgentSessionClient, CheckpointSink, SessionDelta, SessionOptions, SpawnRequest,
    SubAgentBridge, SubAgentEntry, SubAgentOutcome, Tool,
};
use waypoint_core::types::{ContextUsage, ExecutionSnapshot};

// ── Agent sessions ──────────────────────────────────────────────

#[derive(Default)]
struct SessionLog {
    replies: Mutex<VecDeque<Vec<SessionDelta>>>,
    opened: Mutex<Vec<SessionOptions>>,
    messages: Mutex<Vec<String>>,
    closed: AtomicUsize,
    fail_open: Mutex<Option<String>>,
}

/// Agent client that replays scripted replies, one per `send`.
///
/// When the script runs out every reply is the text `"ok"`.
#[derive(Clone, Default)]
pub struct ScriptedSessionClient {
    log: Arc<SessionLog>,
}

impl ScriptedSessionClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a plain-text reply.
    pub fn reply_text(self, text: impl Into<String>) -> Self {
        self.reply(vec![SessionDelta::Text(text.into())])
    }

    /// Queue a reply made of raw deltas.
    pub fn reply(self, deltas: Vec<SessionDelta>) -> Self {
        if let Ok(mut replies) = self.log.replies.lock() {
            replies.push_back(deltas);
        }
        self
    }

    /// Queue a text reply that reports the given context usage.
    pub fn reply_with_usage(self, text: impl Into<String>, usage: ContextUsage) -> Self {
        self.reply(vec![SessionDelta::Text(text.into()), SessionDelta::Usage(usage)])
    }

    /// Make every `open` fail with this message.
    pub fn failing(self, message: impl Into<String>) -> Self {
        if let Ok(mut fail) = self.log.fail_open.lock() {
            *fail = Some(message.into());
        }
        self
    }

    pub fn into_arc(self) -> Arc<dyn AgentSessionClient> {
        Arc::new(self)
    }

    /// Options of every session opened so far.
    pub fn opened(&self) -> Vec<SessionOptions> {
        self.log.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Every message sent, across sessions.
    pub fn messages(&self) -> Vec<String> {
        self.log.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn close_count(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }
}

impl AgentSessionClient for ScriptedSessionClient {
    fn open(&self, options: SessionOptions) -> BoxFuture<'_, Result<Box<dyn AgentSession>>> {
        Box::pin(async move {
            if let Some(message) = self.log.fail_open.lock().ok().and_then(|f| f.clone()) {
                return Err(WaypointError::NodeExecution(message));
            }
            let id = {
                let mut opened = self.log.opened.lock().map_err(lock_err)?;
                opened.push(options);
                format!("session-{}", opened.len())
            };
            Ok(Box::new(ScriptedSession {
                id,
                log: Arc::clone(&self.log),
                usage: None,
            }) as Box<dyn AgentSession>)
        })
    }
}

struct ScriptedSession {
    id: String,
    log: Arc<SessionLog>,
    usage: Option<ContextUsage>,
}

impl AgentSession for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn send<'a>(
        &'a mut self,
        message: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'a, Result<SessionDelta>>>> {
        Box::pin(async move {
            self.log.messages.lock().map_err(lock_err)?.push(message.to_string());
            let deltas = self
                .log
                .replies
                .lock()
                .map_err(lock_err)?
                .pop_front()
                .unwrap_or_else(|| vec![SessionDelta::Text("ok".to_string())]);
            self.usage = deltas.iter().rev().find_map(|d| match d {
                SessionDelta::Usage(u) => Some(*u),
                _ => None,
            });
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }

    fn usage(&self) -> Option<ContextUsage> {
        self.usage
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.log.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

// ── Sub-agents ──────────────────────────────────────────────────

/// Sub-agent bridge with canned answers per agent name.
///
/// Unscripted agents answer `"<agent>: <task>"`.
#[derive(Clone, Default)]
pub struct ScriptedBridge {
    answers: Arc<Mutex<HashMap<String, std::result::Result<String, String>>>>,
    requests: Arc<Mutex<Vec<SpawnRequest>>>,
}

impl ScriptedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, agent: impl Into<String>, output: impl Into<String>) -> Self {
        if let Ok(mut answers) = self.answers.lock() {
            answers.insert(agent.into(), Ok(output.into()));
        }
        self
    }

    /// Report a failed outcome for this agent.
    pub fn fail(self, agent: impl Into<String>, error: impl Into<String>) -> Self {
        if let Ok(mut answers) = self.answers.lock() {
            answers.insert(agent.into(), Err(error.into()));
        }
        self
    }

    pub fn requests(&self) -> Vec<SpawnRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl SubAgentBridge for ScriptedBridge {
    fn spawn(&self, request: SpawnRequest) -> BoxFuture<'_, Result<SubAgentOutcome>> {
        Box::pin(async move {
            self.requests.lock().map_err(lock_err)?.push(request.clone());
            let answer = self.answers.lock().map_err(lock_err)?.get(&request.agent_name).cloned();
            Ok(match answer {
                Some(Ok(output)) => SubAgentOutcome::success(&request, output),
                Some(Err(error)) => SubAgentOutcome::failure(&request, error),
                None => {
                    let output = format!("{}: {}", request.agent_name, request.task);
                    SubAgentOutcome::success(&request, output)
                }
            })
        })
    }
}

/// A registry holding a bare entry for each name.
pub fn registry(names: &[&str]) -> HashMap<String, SubAgentEntry> {
    names
        .iter()
        .map(|name| (name.to_string(), SubAgentEntry::new(*name)))
        .collect()
}

// ── Progress and checkpoints ────────────────────────────────────

/// Collects progress events for later inspection.
#[derive(Clone, Default)]
pub struct RecordingProgress {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> ProgressCallback {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| {
            if let Ok(mut events) = events.lock() {
                events.push(event);
            }
        })
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// `(kind, node_id)` pairs in arrival order.
    pub fn kinds(&self) -> Vec<(ProgressKind, String)> {
        self.events()
            .into_iter()
            .map(|e| (e.kind, e.node_id))
            .collect()
    }

    pub fn count(&self, kind: ProgressKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

/// Sink whose saves always fail. Counts the attempts.
#[derive(Default)]
pub struct FailingCheckpointSink {
    attempts: AtomicUsize,
}

impl FailingCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl CheckpointSink for FailingCheckpointSink {
    fn save<'a>(
        &'a self,
        _execution_id: &'a str,
        _snapshot: &'a ExecutionSnapshot,
        _label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(WaypointError::Checkpoint("disk full".to_string()))
        })
    }

    fn load<'a>(
        &'a self,
        _execution_id: &'a str,
        _label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ExecutionSnapshot>>> {
        Box::pin(async { Ok(None) })
    }

    fn list<'a>(&'a self, _execution_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async { Ok(vec![]) })
    }

    fn delete<'a>(
        &'a self,
        _execution_id: &'a str,
        _label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async { Ok(0) })
    }
}

// ── Tools ───────────────────────────────────────────────────────

/// Echoes its `text` argument back as `{"echo": text}`.
pub struct EchoTool;

impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the input text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn execute(&self, input: Value, _state: Arc<WorkflowState>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move { Ok(json!({ "echo": input["text"] })) })
    }
}

// ── Fixtures ────────────────────────────────────────────────────

/// Field map from a JSON object literal. Non-objects give an empty map.
pub fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Write a config file into a fresh temp dir.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("temp dir: {e}"));
    let path = dir.path().join("waypoint.toml");
    std::fs::write(&path, content).unwrap_or_else(|e| panic!("write config: {e}"));
    (dir, path)
}

fn lock_err<E: std::fmt::Display>(e: E) -> WaypointError {
    WaypointError::NodeExecution(format!("mock lock poisoned: {e}"))
}
