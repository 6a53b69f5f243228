//! SQLite-based task store.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::TaskStore;
use crate::task::{Task, TraceEvent};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS task_streams (
    task_id TEXT PRIMARY KEY NOT NULL,
    content TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_traces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    record TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_traces_task ON task_traces(task_id, id);
"#;

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| format!("Failed to create task store dir: {}", e))?;
        let db_path = base_dir.join("tasks.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn parse_task(json: &str) -> Result<Task, String> {
    serde_json::from_str(json).map_err(|e| format!("Failed to parse task record: {}", e))
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, String> {
        let records = self
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT record FROM tasks ORDER BY updated_at DESC")
                    .map_err(|e| e.to_string())?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(|e| e.to_string())?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| e.to_string())?;
                Ok(rows)
            })
            .await?;

        Ok(records
            .iter()
            .filter_map(|json| match parse_task(json) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!("Skipping unreadable task row: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, String> {
        let id = id.to_string();
        let record = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT record FROM tasks WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(|e| e.to_string())
            })
            .await?;
        record.as_deref().map(parse_task).transpose()
    }

    async fn put_task(&self, task: &Task) -> Result<(), String> {
        let record =
            serde_json::to_string(task).map_err(|e| format!("Failed to serialize task: {}", e))?;
        let (id, status, updated_at) = (
            task.id.clone(),
            task.status.as_str().to_string(),
            task.updated_at.clone(),
        );
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, updated_at, record) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                     updated_at = excluded.updated_at, record = excluded.record",
                params![id, status, updated_at, record],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<bool, String> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let removed = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .map_err(|e| e.to_string())?;
            conn.execute("DELETE FROM task_streams WHERE task_id = ?1", params![id])
                .map_err(|e| e.to_string())?;
            conn.execute("DELETE FROM task_traces WHERE task_id = ?1", params![id])
                .map_err(|e| e.to_string())?;
            Ok(removed > 0)
        })
        .await
    }

    async fn append_stream(&self, id: &str, text: &str) -> Result<(), String> {
        let (id, text) = (id.to_string(), text.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_streams (task_id, content) VALUES (?1, ?2)
                 ON CONFLICT(task_id) DO UPDATE SET content = content || excluded.content",
                params![id, text],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn read_stream(&self, id: &str) -> Result<String, String> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT content FROM task_streams WHERE task_id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map(Option::unwrap_or_default)
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn clear_stream(&self, id: &str) -> Result<(), String> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM task_streams WHERE task_id = ?1", params![id])
                .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<(), String> {
        let record =
            serde_json::to_string(event).map_err(|e| format!("Failed to serialize trace: {}", e))?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_traces (task_id, record) VALUES (?1, ?2)",
                params![id, record],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn read_traces(&self, id: &str) -> Result<Vec<TraceEvent>, String> {
        let id = id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT record FROM task_traces WHERE task_id = ?1 ORDER BY id")
                    .map_err(|e| e.to_string())?;
                let rows = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))
                    .map_err(|e| e.to_string())?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| e.to_string())?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| format!("Failed to parse trace: {}", e))
            })
            .collect()
    }
}
