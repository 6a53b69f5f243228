//! File-per-key task store.
//!
//! Layout under the data directory:
//! - `tasks/<id>.json` written to a temp file and renamed into place
//! - `streams/<id>.txt` appended
//! - `traces/<id>.jsonl` appended, one [`TraceEvent`] per line

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::TaskStore;
use crate::task::{Task, TraceEvent};
use crate::util::sanitize_filename;

#[derive(Clone)]
pub struct FileTaskStore {
    tasks_dir: PathBuf,
    streams_dir: PathBuf,
    traces_dir: PathBuf,
}

impl FileTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, String> {
        let store = Self {
            tasks_dir: base_dir.join("tasks"),
            streams_dir: base_dir.join("streams"),
            traces_dir: base_dir.join("traces"),
        };
        for dir in [&store.tasks_dir, &store.streams_dir, &store.traces_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| format!("Failed to create task store dir {}: {}", dir.display(), e))?;
        }
        Ok(store)
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{}.json", sanitize_filename(id)))
    }

    fn stream_path(&self, id: &str) -> PathBuf {
        self.streams_dir.join(format!("{}.txt", sanitize_filename(id)))
    }

    fn trace_path(&self, id: &str) -> PathBuf {
        self.traces_dir.join(format!("{}.jsonl", sanitize_filename(id)))
    }

    async fn read_task_file(path: &Path) -> Result<Option<Task>, String> {
        match fs::read(path).await {
            Ok(bytes) => serde_json::from_slice::<Task>(&bytes)
                .map(Some)
                .map_err(|e| format!("Failed to parse task {}: {}", path.display(), e)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(format!("Failed to read task {}: {}", path.display(), err)),
        }
    }

    async fn append(path: &Path, text: &str) -> Result<(), String> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| format!("Failed to open {}: {}", path.display(), e))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| format!("Failed to append {}: {}", path.display(), e))?;
        file.flush()
            .await
            .map_err(|e| format!("Failed to flush {}: {}", path.display(), e))
    }

    async fn remove_if_exists(path: &Path) -> Result<bool, String> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(format!("Failed to remove {}: {}", path.display(), err)),
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, String> {
        let mut entries = fs::read_dir(&self.tasks_dir)
            .await
            .map_err(|e| format!("Failed to list tasks: {}", e))?;
        let mut tasks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| format!("Failed to list tasks: {}", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_task_file(&path).await {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable task file: {}", e),
            }
        }
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, String> {
        Self::read_task_file(&self.task_path(id)).await
    }

    async fn put_task(&self, task: &Task) -> Result<(), String> {
        let path = self.task_path(&task.id);
        let data = serde_json::to_vec_pretty(task)
            .map_err(|e| format!("Failed to serialize task: {}", e))?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| format!("Failed to write task: {}", e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| format!("Failed to finalize task: {}", e))?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, String> {
        let existed = Self::remove_if_exists(&self.task_path(id)).await?;
        Self::remove_if_exists(&self.stream_path(id)).await?;
        Self::remove_if_exists(&self.trace_path(id)).await?;
        Ok(existed)
    }

    async fn append_stream(&self, id: &str, text: &str) -> Result<(), String> {
        Self::append(&self.stream_path(id), text).await
    }

    async fn read_stream(&self, id: &str) -> Result<String, String> {
        match fs::read(self.stream_path(id)).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(format!("Failed to read stream: {}", err)),
        }
    }

    async fn clear_stream(&self, id: &str) -> Result<(), String> {
        Self::remove_if_exists(&self.stream_path(id)).await.map(|_| ())
    }

    async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<(), String> {
        let mut line =
            serde_json::to_string(event).map_err(|e| format!("Failed to serialize trace: {}", e))?;
        line.push('\n');
        Self::append(&self.trace_path(id), &line).await
    }

    async fn read_traces(&self, id: &str) -> Result<Vec<TraceEvent>, String> {
        let text = match fs::read_to_string(self.trace_path(id)).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(format!("Failed to read traces: {}", err)),
        };
        Ok(text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Skipping malformed trace line: {}", e);
                    None
                }
            })
            .collect())
    }
}
