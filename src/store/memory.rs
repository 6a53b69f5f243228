//! In-memory task store (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::TaskStore;
use crate::task::{Task, TraceEvent};

#[derive(Default)]
struct Records {
    tasks: HashMap<String, Task>,
    streams: HashMap<String, String>,
    traces: HashMap<String, Vec<TraceEvent>>,
}

#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    records: Arc<RwLock<Records>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, String> {
        let mut tasks: Vec<Task> = self.records.read().await.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, String> {
        Ok(self.records.read().await.tasks.get(id).cloned())
    }

    async fn put_task(&self, task: &Task) -> Result<(), String> {
        self.records
            .write()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool, String> {
        let mut records = self.records.write().await;
        records.streams.remove(id);
        records.traces.remove(id);
        Ok(records.tasks.remove(id).is_some())
    }

    async fn append_stream(&self, id: &str, text: &str) -> Result<(), String> {
        self.records
            .write()
            .await
            .streams
            .entry(id.to_string())
            .or_default()
            .push_str(text);
        Ok(())
    }

    async fn read_stream(&self, id: &str) -> Result<String, String> {
        Ok(self
            .records
            .read()
            .await
            .streams
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear_stream(&self, id: &str) -> Result<(), String> {
        self.records.write().await.streams.remove(id);
        Ok(())
    }

    async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<(), String> {
        self.records
            .write()
            .await
            .traces
            .entry(id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn read_traces(&self, id: &str) -> Result<Vec<TraceEvent>, String> {
        Ok(self
            .records
            .read()
            .await
            .traces
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}
