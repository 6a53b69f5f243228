//! Serialized read-modify-write access to task records.
//!
//! Every mutation of a task goes through [`TaskLedger::update`], which holds a per-task
//! async mutex across the read, the caller's change and the write. Two writers on the
//! same task id never interleave; writers on different tasks never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use super::{StoreError, TaskStore};
use crate::task::Task;

#[derive(Clone)]
pub struct TaskLedger {
    store: Arc<dyn TaskStore>,
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    /// Drop the task's lock entry once no writer holds or waits on it.
    fn release(&self, id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        drop(lock);
        if locks.get(id).is_some_and(|entry| Arc::strong_count(entry) == 1) {
            locks.remove(id);
        }
    }

    pub async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.store
            .get_task(id)
            .await
            .map_err(StoreError::Backend)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let lock = self.lock_for(&task.id);
        let result = {
            let _guard = lock.lock().await;
            self.store.put_task(task).await.map_err(StoreError::Backend)
        };
        self.release(&task.id, lock);
        result
    }

    /// Apply `change` to the stored task and persist it.
    ///
    /// When `change` returns an error nothing is written. On success the task's
    /// `updated_at` is refreshed and the persisted task is returned with the closure's
    /// value.
    pub async fn update<T, E, F>(&self, id: &str, change: F) -> Result<(Task, T), E>
    where
        F: FnOnce(&mut Task) -> Result<T, E>,
        E: From<StoreError>,
    {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            self.apply(id, change).await
        };
        self.release(id, lock);
        result
    }

    async fn apply<T, E, F>(&self, id: &str, change: F) -> Result<(Task, T), E>
    where
        F: FnOnce(&mut Task) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut task = self.get(id).await?;
        let value = change(&mut task)?;
        task.touch();
        self.store
            .put_task(&task)
            .await
            .map_err(StoreError::Backend)?;
        Ok((task, value))
    }

    /// Delete the task record, its stream and traces.
    pub async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let lock = self.lock_for(id);
        let removed = {
            let _guard = lock.lock().await;
            self.store.delete_task(id).await.map_err(StoreError::Backend)
        };
        self.release(id, lock);
        removed
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::sample_task;
    use crate::store::InMemoryTaskStore;
    use crate::task::{Problem, TaskStatus};

    #[tokio::test]
    async fn test_rejected_change_writes_nothing() {
        let ledger = TaskLedger::new(Arc::new(InMemoryTaskStore::new()));
        let task = sample_task();
        ledger.insert(&task).await.expect("insert");

        let result: Result<(Task, ()), StoreError> = ledger
            .update(&task.id, |t| {
                t.status = TaskStatus::Completed;
                Err(StoreError::Backend("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.get(&task.id).await.expect("get").status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let ledger = TaskLedger::new(Arc::new(InMemoryTaskStore::new()));
        let task = sample_task();
        ledger.insert(&task).await.expect("insert");

        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = ledger.clone();
            let id = task.id.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .update::<_, StoreError, _>(&id, |t| {
                        t.problems.push(Problem::new(format!("r{}", i), "p"));
                        Ok(())
                    })
                    .await
                    .expect("update");
            }));
        }
        for handle in handles {
            handle.await.expect("join");
        }
        assert_eq!(ledger.get(&task.id).await.expect("get").problems.len(), 16);
        assert_eq!(ledger.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_entries_do_not_outlive_writers() {
        let ledger = TaskLedger::new(Arc::new(InMemoryTaskStore::new()));
        for _ in 0..8 {
            let task = sample_task();
            ledger.insert(&task).await.expect("insert");
            ledger
                .update::<_, StoreError, _>(&task.id, |t| {
                    t.status = TaskStatus::Processing;
                    Ok(())
                })
                .await
                .expect("update");
        }
        let _ = ledger.update::<(), StoreError, _>("missing", |_| Ok(())).await;
        assert_eq!(ledger.held_locks(), 0);
    }

    #[tokio::test]
    async fn test_missing_task_is_not_found() {
        let ledger = TaskLedger::new(Arc::new(InMemoryTaskStore::new()));
        let err = ledger
            .update::<(), StoreError, _>("nope", |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".into()));
    }
}
