use std::collections::HashMap;
use std::sync::RwLock;

use futures::future::BoxFuture;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::ExecutionSnapshot;

use super::DEFAULT_LABEL;

/// In-process sink. Checkpoints live as long as the sink.
#[derive(Default)]
pub struct MemoryCheckpointSink {
    // Per execution, labelled snapshots in save order.
    entries: RwLock<HashMap<String, Vec<(String, ExecutionSnapshot)>>>,
}

impl MemoryCheckpointSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints held across all executions.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> WaypointError {
    WaypointError::Checkpoint(format!("checkpoint lock poisoned: {e}"))
}

impl CheckpointSink for MemoryCheckpointSink {
    fn save<'a>(
        &'a self,
        execution_id: &'a str,
        snapshot: &'a ExecutionSnapshot,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let label = label.unwrap_or(DEFAULT_LABEL).to_string();
            let mut entries = self.entries.write().map_err(poisoned)?;
            let saved = entries.entry(execution_id.to_string()).or_default();
            saved.retain(|(l, _)| *l != label);
            saved.push((label, snapshot.clone()));
            Ok(())
        })
    }

    fn load<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ExecutionSnapshot>>> {
        Box::pin(async move {
            let entries = self.entries.read().map_err(poisoned)?;
            let Some(saved) = entries.get(execution_id) else {
                return Ok(None);
            };
            let found = match label {
                Some(label) => saved.iter().find(|(l, _)| l == label),
                None => saved.last(),
            };
            Ok(found.map(|(_, s)| s.clone()))
        })
    }

    fn list<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let entries = self.entries.read().map_err(poisoned)?;
            Ok(entries
                .get(execution_id)
                .map(|saved| saved.iter().map(|(l, _)| l.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn delete<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut entries = self.entries.write().map_err(poisoned)?;
            let removed = match label {
                None => entries.remove(execution_id).map(|s| s.len()).unwrap_or(0),
                Some(label) => match entries.get_mut(execution_id) {
                    Some(saved) => {
                        let before = saved.len();
                        saved.retain(|(l, _)| l != label);
                        before - saved.len()
                    }
                    None => 0,
                },
            };
            Ok(removed)
        })
    }
}
