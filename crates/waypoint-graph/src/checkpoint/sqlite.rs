use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use waypoint_core::error::{Result, WaypointError};
use waypoint_core::traits::CheckpointSink;
use waypoint_core::types::ExecutionSnapshot;

use super::DEFAULT_LABEL;

/// Persistent sink backed by SQLite.
pub struct SqliteCheckpointSink {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointSink {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| WaypointError::Database(format!("Failed to open checkpoint store: {e}")))?;
        Self::init(conn)
    }

    /// A throwaway database, mostly for tests and demos.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 execution_id TEXT NOT NULL,
                 label TEXT NOT NULL,
                 status TEXT NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_cp_execution
                 ON checkpoints(execution_id, id DESC);",
        )
        .map_err(|e| WaypointError::Database(format!("Failed to initialize checkpoint schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Execution ids with at least one checkpoint, most recent first.
    pub fn executions(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id FROM checkpoints
                 GROUP BY execution_id
                 ORDER BY MAX(id) DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WaypointError::Checkpoint(e.to_string()))
    }

    fn save_sync(&self, execution_id: &str, snapshot: &ExecutionSnapshot, label: &str) -> Result<()> {
        let json = snapshot.to_json()?;
        let conn = self.lock()?;

        // Same label replaces the older checkpoint
        conn.execute(
            "DELETE FROM checkpoints WHERE execution_id = ?1 AND label = ?2",
            params![execution_id, label],
        )
        .map_err(|e| WaypointError::Database(format!("Failed to clean old checkpoint: {e}")))?;

        conn.execute(
            "INSERT INTO checkpoints (execution_id, label, status, snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution_id,
                label,
                snapshot.status.to_string(),
                json,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| WaypointError::Database(format!("Failed to save checkpoint: {e}")))?;

        debug!(execution_id, label, "Checkpoint written");
        Ok(())
    }

    fn load_sync(&self, execution_id: &str, label: Option<&str>) -> Result<Option<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let json: Option<String> = match label {
            Some(label) => conn
                .query_row(
                    "SELECT snapshot_json FROM checkpoints
                     WHERE execution_id = ?1 AND label = ?2",
                    params![execution_id, label],
                    |row| row.get(0),
                )
                .optional(),
            None => conn
                .query_row(
                    "SELECT snapshot_json FROM checkpoints
                     WHERE execution_id = ?1
                     ORDER BY id DESC
                     LIMIT 1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional(),
        }
        .map_err(db_err)?;

        json.map(|j| ExecutionSnapshot::from_json(&j)).transpose()
    }

    fn list_sync(&self, execution_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT label FROM checkpoints WHERE execution_id = ?1 ORDER BY id ASC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![execution_id], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(db_err)
    }

    fn delete_sync(&self, execution_id: &str, label: Option<&str>) -> Result<usize> {
        let conn = self.lock()?;
        let deleted = match label {
            Some(label) => conn.execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1 AND label = ?2",
                params![execution_id, label],
            ),
            None => conn.execute(
                "DELETE FROM checkpoints WHERE execution_id = ?1",
                params![execution_id],
            ),
        }
        .map_err(|e| WaypointError::Database(format!("Failed to delete checkpoint: {e}")))?;
        Ok(deleted)
    }
}

fn db_err(e: rusqlite::Error) -> WaypointError {
    WaypointError::Database(e.to_string())
}

impl CheckpointSink for SqliteCheckpointSink {
    fn save<'a>(
        &'a self,
        execution_id: &'a str,
        snapshot: &'a ExecutionSnapshot,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.save_sync(execution_id, snapshot, label.unwrap_or(DEFAULT_LABEL)) })
    }

    fn load<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<ExecutionSnapshot>>> {
        Box::pin(async move { self.load_sync(execution_id, label) })
    }

    fn list<'a>(&'a self, execution_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move { self.list_sync(execution_id) })
    }

    fn delete<'a>(
        &'a self,
        execution_id: &'a str,
        label: Option<&'a str>,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move { self.delete_sync(execution_id, label) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waypoint_core::state::WorkflowState;
    use waypoint_core::types::ExecutionStatus;

    fn temp_sink() -> (tempfile::TempDir, SqliteCheckpointSink) {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteCheckpointSink::open(&dir.path().join("nested").join("checkpoints.db")).unwrap();
        (dir, sink)
    }

    fn snapshot(id: &str, step: usize, status: ExecutionStatus) -> ExecutionSnapshot {
        let now = Utc::now();
        ExecutionSnapshot {
            execution_id: id.into(),
            state: WorkflowState::new(id).with_field("step", json!(step)),
            status,
            current_node: Some(format!("n{step}")),
            visited_nodes: (1..=step).map(|i| format!("n{i}")).collect(),
            errors: vec![],
            signals: vec![],
            pending_nodes: vec![format!("n{}", step + 1)],
            started_at: now,
            updated_at: now,
            node_execution_count: step,
            step_count: step,
            context_usage: None,
            route_on_resume: false,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_dir, sink) = temp_sink();
        let snap = snapshot("exec-1", 2, ExecutionStatus::Paused);
        sink.save("exec-1", &snap, Some("step-2")).await.unwrap();

        let loaded = sink.load("exec-1", None).await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        let labelled = sink.load("exec-1", Some("step-2")).await.unwrap().unwrap();
        assert_eq!(labelled.pending_nodes, vec!["n3"]);
    }

    #[tokio::test]
    async fn test_latest_and_replace() {
        let (_dir, sink) = temp_sink();
        sink.save("exec-1", &snapshot("exec-1", 1, ExecutionStatus::Running), Some("a")).await.unwrap();
        sink.save("exec-1", &snapshot("exec-1", 2, ExecutionStatus::Running), Some("b")).await.unwrap();
        sink.save("exec-1", &snapshot("exec-1", 3, ExecutionStatus::Running), Some("a")).await.unwrap();

        assert_eq!(sink.list("exec-1").await.unwrap(), vec!["b", "a"]);
        assert_eq!(sink.load("exec-1", None).await.unwrap().unwrap().step_count, 3);
        assert_eq!(sink.load("exec-1", Some("b")).await.unwrap().unwrap().step_count, 2);
    }

    #[tokio::test]
    async fn test_delete_and_executions() {
        let (_dir, sink) = temp_sink();
        sink.save("exec-1", &snapshot("exec-1", 1, ExecutionStatus::Running), None).await.unwrap();
        sink.save("exec-2", &snapshot("exec-2", 1, ExecutionStatus::Running), Some("x")).await.unwrap();
        sink.save("exec-2", &snapshot("exec-2", 2, ExecutionStatus::Running), Some("y")).await.unwrap();

        assert_eq!(sink.executions().unwrap(), vec!["exec-2", "exec-1"]);
        assert_eq!(sink.delete("exec-2", Some("x")).await.unwrap(), 1);
        assert_eq!(sink.delete("exec-2", None).await.unwrap(), 1);
        assert!(sink.load("exec-2", None).await.unwrap().is_none());
        assert_eq!(sink.list("exec-1").await.unwrap(), vec![DEFAULT_LABEL]);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let sink = SqliteCheckpointSink::in_memory().unwrap();
        assert!(sink.load("nonexistent", None).await.unwrap().is_none());
        assert!(sink.list("nonexistent").await.unwrap().is_empty());
    }
}
