use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use flowforge_core::error::{FlowError, Result};
use flowforge_core::graph::GraphSubmission;
use flowforge_core::traits::{GraphStore, RunStore};
use flowforge_core::types::{NodeStatus, Run, RunEvent, RunId, RunStatus, RunUpdate};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        status TEXT NOT NULL,
        execution_order TEXT NOT NULL,
        total_nodes INTEGER NOT NULL,
        completed_nodes INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        finished_at TEXT,
        error TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id);

    CREATE TABLE IF NOT EXISTS run_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events(run_id, id);

    CREATE TABLE IF NOT EXISTS graphs (
        project_id TEXT PRIMARY KEY,
        graph TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

fn db_err(e: impl std::fmt::Display) -> FlowError {
    FlowError::Store(e.to_string())
}

fn parse_ts(ts: Option<String>) -> Option<DateTime<Utc>> {
    ts.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// SQLite-backed run log and graph store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| FlowError::Store(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent runs of a project, newest first.
    pub fn recent_runs(&self, project_id: &str, limit: usize) -> Result<Vec<Run>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, status, execution_order, total_nodes, completed_nodes,
                        started_at, finished_at, error
                 FROM runs
                 WHERE project_id = ?1
                 ORDER BY started_at DESC
                 LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![project_id, limit as i64], RunRow::read)
            .map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.map_err(db_err)?.into_run()?);
        }
        Ok(runs)
    }
}

/// Raw `runs` row before status and JSON decoding.
struct RunRow {
    id: String,
    project_id: String,
    status: String,
    execution_order: String,
    total_nodes: i64,
    completed_nodes: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            status: row.get(2)?,
            execution_order: row.get(3)?,
            total_nodes: row.get(4)?,
            completed_nodes: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            error: row.get(8)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| FlowError::Store(format!("unknown run status '{}'", self.status)))?;
        Ok(Run {
            id: RunId::from_string(&self.id),
            project_id: self.project_id,
            status,
            execution_order: serde_json::from_str(&self.execution_order)?,
            total_nodes: self.total_nodes as usize,
            completed_nodes: self.completed_nodes as usize,
            started_at: parse_ts(self.started_at),
            finished_at: parse_ts(self.finished_at),
            error: self.error,
        })
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &Run) -> BoxFuture<'_, Result<()>> {
        let run = run.clone();
        Box::pin(async move {
            let order = serde_json::to_string(&run.execution_order)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO runs (id, project_id, status, execution_order, total_nodes,
                                   completed_nodes, started_at, finished_at, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run.id.to_string(),
                    run.project_id,
                    run.status.as_str(),
                    order,
                    run.total_nodes as i64,
                    run.completed_nodes as i64,
                    run.started_at.map(|t| t.to_rfc3339()),
                    run.finished_at.map(|t| t.to_rfc3339()),
                    run.error,
                ],
            )
            .map_err(db_err)?;
            debug!(run_id = %run.id, "Run record created");
            Ok(())
        })
    }

    fn update_run(&self, run_id: &RunId, update: RunUpdate) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let order = update
                .execution_order
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let conn = self.conn.lock().map_err(db_err)?;
            // completed_nodes never goes backwards
            let changed = conn
                .execute(
                    "UPDATE runs SET
                        status = COALESCE(?2, status),
                        execution_order = COALESCE(?3, execution_order),
                        total_nodes = COALESCE(?4, total_nodes),
                        completed_nodes = MAX(completed_nodes, COALESCE(?5, completed_nodes)),
                        started_at = COALESCE(?6, started_at),
                        finished_at = COALESCE(?7, finished_at),
                        error = COALESCE(?8, error)
                     WHERE id = ?1",
                    params![
                        run_id.to_string(),
                        update.status.map(|s| s.as_str()),
                        order,
                        update.total_nodes.map(|n| n as i64),
                        update.completed_nodes.map(|n| n as i64),
                        update.started_at.map(|t| t.to_rfc3339()),
                        update.finished_at.map(|t| t.to_rfc3339()),
                        update.error,
                    ],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(FlowError::RunNotFound(run_id.to_string()));
            }
            Ok(())
        })
    }

    fn append_run_event(
        &self,
        run_id: &RunId,
        node_id: &str,
        status: NodeStatus,
        payload: Value,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.to_string();
        let node_id = node_id.to_string();
        Box::pin(async move {
            let payload = serde_json::to_string(&payload)?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO run_events (run_id, node_id, status, payload, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id, node_id, status.as_str(), payload, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn get_run(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<Run>>> {
        let run_id = run_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let row = conn
                .query_row(
                    "SELECT id, project_id, status, execution_order, total_nodes, completed_nodes,
                            started_at, finished_at, error
                     FROM runs WHERE id = ?1",
                    params![run_id],
                    RunRow::read,
                )
                .optional()
                .map_err(db_err)?;
            row.map(RunRow::into_run).transpose()
        })
    }

    fn run_events(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<RunEvent>>> {
        let run_id = run_id.clone();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT node_id, status, payload, timestamp FROM run_events
                     WHERE run_id = ?1
                     ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![run_id.to_string()], |row| {
                    let node_id: String = row.get(0)?;
                    let status: String = row.get(1)?;
                    let payload: String = row.get(2)?;
                    let ts: String = row.get(3)?;
                    Ok((node_id, status, payload, ts))
                })
                .map_err(db_err)?;

            let mut events = Vec::new();
            for row in rows {
                let (node_id, status, payload, ts) = row.map_err(db_err)?;
                let status = NodeStatus::parse(&status)
                    .ok_or_else(|| FlowError::Store(format!("unknown node status '{}'", status)))?;
                events.push(RunEvent {
                    run_id: run_id.clone(),
                    node_id,
                    status,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
                    timestamp: parse_ts(Some(ts)).unwrap_or_else(Utc::now),
                });
            }
            Ok(events)
        })
    }
}

impl GraphStore for SqliteStore {
    fn save_graph(&self, submission: &GraphSubmission) -> BoxFuture<'_, Result<()>> {
        let project_id = submission.project_id.clone();
        let graph = serde_json::to_string(submission);
        Box::pin(async move {
            let graph = graph?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO graphs (project_id, graph, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(project_id) DO UPDATE SET graph = excluded.graph, updated_at = excluded.updated_at",
                params![project_id, graph, Utc::now().to_rfc3339()],
            )
            .map_err(db_err)?;
            debug!(project_id = %project_id, "Graph saved");
            Ok(())
        })
    }

    fn load_graph(&self, project_id: &str) -> BoxFuture<'_, Result<Option<GraphSubmission>>> {
        let project_id = project_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let graph: Option<String> = conn
                .query_row(
                    "SELECT graph FROM graphs WHERE project_id = ?1",
                    params![project_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            match graph {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::graph::{Edge, Node, NodeKind, Port};
    use serde_json::json;

    fn run(id: &str) -> Run {
        Run {
            id: RunId::from_string(id),
            project_id: "proj".into(),
            status: RunStatus::Running,
            execution_order: vec!["a".into(), "b".into()],
            total_nodes: 2,
            completed_nodes: 0,
            started_at: Some(Utc::now()),
            finished_at: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let id = RunId::from_string("r1");
        store.create_run(&run("r1")).await.unwrap();

        store
            .update_run(&id, RunUpdate::completed_nodes(2))
            .await
            .unwrap();
        // A stale count does not move the counter back.
        store
            .update_run(&id, RunUpdate::completed_nodes(1))
            .await
            .unwrap();
        store
            .update_run(&id, RunUpdate::finished(RunStatus::Completed, None))
            .await
            .unwrap();

        let loaded = store.get_run(&id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.completed_nodes, 2);
        assert_eq!(loaded.execution_order, vec!["a", "b"]);
        assert!(loaded.finished_at.is_some());
        assert!(loaded.error.is_none());

        assert!(store
            .get_run(&RunId::from_string("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_run() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_run(&RunId::from_string("nope"), RunUpdate::status(RunStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn test_events_in_append_order() {
        let store = SqliteStore::in_memory().unwrap();
        let id = RunId::from_string("r1");
        store.create_run(&run("r1")).await.unwrap();
        store
            .append_run_event(&id, "a", NodeStatus::Running, Value::Null)
            .await
            .unwrap();
        store
            .append_run_event(&id, "a", NodeStatus::Failed, json!({"error": "boom"}))
            .await
            .unwrap();
        store
            .append_run_event(&id, "b", NodeStatus::Skipped, json!({}))
            .await
            .unwrap();

        let events = store.run_events(&id).await.unwrap();
        let seen: Vec<_> = events.iter().map(|e| (e.node_id.as_str(), e.status)).collect();
        assert_eq!(
            seen,
            vec![
                ("a", NodeStatus::Running),
                ("a", NodeStatus::Failed),
                ("b", NodeStatus::Skipped)
            ]
        );
        assert_eq!(events[1].payload["error"], "boom");
        assert!(store
            .run_events(&RunId::from_string("other"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_graph_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let mut submission = GraphSubmission {
            project_id: "proj".into(),
            nodes: vec![
                Node::new("a", NodeKind::Input).with_output(Port::output("text", "text/plain")),
                Node::new("b", NodeKind::Output).with_input(Port::input("in", "any")),
            ],
            edges: vec![Edge::new("e1", ("a", "text"), ("b", "in"))],
        };
        store.save_graph(&submission).await.unwrap();
        submission.edges.clear();
        store.save_graph(&submission).await.unwrap();

        let loaded = store.load_graph("proj").await.unwrap().unwrap();
        assert_eq!(loaded.nodes, submission.nodes);
        assert!(loaded.edges.is_empty());
        assert!(store.load_graph("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowforge.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_run(&run("r1")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let runs = store.recent_runs("proj", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, RunId::from_string("r1"));
    }
}
