//! Task storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `file`: one JSON file per task, plus a stream text file and a JSONL trace file
//! - `sqlite`: SQLite database holding the same three records per task
//!
//! Per task id the store keeps one [`Task`] record, one append-only stream text blob and
//! zero or more [`TraceEvent`] records. The only consistency the rest of the crate relies
//! on is read-after-write for a single key; read-modify-write sequences are serialized
//! by [`TaskLedger`].

mod assets;
mod file;
mod ledger;
mod memory;
mod sqlite;

pub use assets::AssetStore;
pub use file::FileTaskStore;
pub use ledger::TaskLedger;
pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::task::{Task, TraceEvent};

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// All tasks, most recently updated first.
    async fn list_tasks(&self) -> Result<Vec<Task>, String>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, String>;

    /// Insert or replace a task record (last writer wins).
    async fn put_task(&self, task: &Task) -> Result<(), String>;

    /// Delete a task with its stream and traces. Returns false if it did not exist.
    async fn delete_task(&self, id: &str) -> Result<bool, String>;

    async fn append_stream(&self, id: &str, text: &str) -> Result<(), String>;

    /// Full stream text; empty when nothing was streamed yet.
    async fn read_stream(&self, id: &str) -> Result<String, String>;

    async fn clear_stream(&self, id: &str) -> Result<(), String>;

    async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<(), String>;

    async fn read_traces(&self, id: &str) -> Result<Vec<TraceEvent>, String>;
}

/// Failure of a store-backed operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Backend(String),
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    #[default]
    File,
    Sqlite,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "file" | "json" => Some(Self::File),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

/// Create a task store based on type and data directory.
pub async fn create_task_store(
    store_type: TaskStoreType,
    base_dir: PathBuf,
) -> Result<Arc<dyn TaskStore>, String> {
    match store_type {
        TaskStoreType::Memory => Ok(Arc::new(InMemoryTaskStore::new())),
        TaskStoreType::File => Ok(Arc::new(FileTaskStore::new(base_dir).await?)),
        TaskStoreType::Sqlite => Ok(Arc::new(SqliteTaskStore::new(base_dir).await?)),
    }
}
