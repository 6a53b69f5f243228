//! Task lifecycle owner.
//!
//! [`TaskService`] is the only place that changes a task's status. Each run executes on
//! its own tokio task, registered in `runs` under the task id before the task moves to
//! `processing` and removed right after the stream's `done` is sent. While a task id is
//! registered no other run, rerun or deletion may start for it.
//!
//! A run is spawned inside a supervising task, so an error or a panic in the pipeline
//! still ends with a persisted `failed` status and exactly one `done` event.

mod error;

pub use error::ServiceError;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::pipeline::{PipelineError, PipelineOrchestrator, RunContext, RunMode, RunOutcome, Stage};
use crate::store::TaskLedger;
use crate::stream::{StreamBroker, Subscription};
use crate::task::{
    AssetRef, CropRegion, ProblemOverride, ProblemSummary, Task, TaskHints, TaskStatus, TraceEvent,
};
use crate::util::tail_chars;

/// Filter for [`TaskService::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub active_only: bool,
    /// Exact match on the task's subject hint
    pub subject: Option<String>,
}

/// What an event-stream client starts from.
pub enum EventFeed {
    /// No run will publish anymore; replay the text and report the status
    Finished { task: Task, text: String },
    /// Follow the subscription until `done`
    Live { task: Task, subscription: Subscription },
}

type RunMap = Arc<StdMutex<HashMap<String, CancellationToken>>>;

/// Writes of a run's final status before the stream is aborted instead.
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

/// Claim on a task id; released on drop.
struct RunSlot {
    runs: RunMap,
    task_id: String,
}

impl RunSlot {
    fn claim(runs: &RunMap, task_id: &str, cancel: CancellationToken) -> Result<Self, ServiceError> {
        let mut map = runs.lock().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(task_id) {
            return Err(ServiceError::Conflict(format!(
                "Task {} already has a run in flight",
                task_id
            )));
        }
        map.insert(task_id.to_string(), cancel);
        Ok(Self {
            runs: Arc::clone(runs),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.task_id);
    }
}

#[derive(Clone)]
pub struct TaskService {
    ledger: TaskLedger,
    broker: Arc<StreamBroker>,
    orchestrator: Arc<PipelineOrchestrator>,
    runs: RunMap,
    replay_max_chars: usize,
}

impl TaskService {
    pub fn new(
        ledger: TaskLedger,
        broker: Arc<StreamBroker>,
        orchestrator: Arc<PipelineOrchestrator>,
        replay_max_chars: usize,
    ) -> Self {
        Self {
            ledger,
            broker,
            orchestrator,
            runs: Arc::new(StdMutex::new(HashMap::new())),
            replay_max_chars,
        }
    }

    fn is_running(&self, task_id: &str) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_id)
    }

    pub async fn create(
        &self,
        asset: AssetRef,
        hints: TaskHints,
        regions: Vec<CropRegion>,
    ) -> Result<Task, ServiceError> {
        let mut seen = Vec::new();
        for region in &regions {
            if region.id.trim().is_empty() {
                return Err(ServiceError::InvalidInput("Region id must not be empty".to_string()));
            }
            if seen.contains(&region.id) {
                return Err(ServiceError::InvalidInput(format!(
                    "Duplicate region id: {}",
                    region.id
                )));
            }
            seen.push(region.id.clone());
        }

        let task = Task::new(asset, hints, regions);
        self.ledger.insert(&task).await?;
        tracing::info!(task_id = %task.id, regions = task.regions.len(), "Task created");
        Ok(task)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, ServiceError> {
        Ok(self.ledger.get(task_id).await?)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, ServiceError> {
        let tasks = self
            .ledger
            .store()
            .list_tasks()
            .await
            .map_err(ServiceError::Store)?;
        Ok(tasks
            .into_iter()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| !filter.active_only || t.status.is_active())
            .filter(|t| filter.subject.as_deref().map_or(true, |s| t.hints.subject == s))
            .collect())
    }

    /// Problems of every task, newest task first, optionally narrowed to one subject
    /// and to problems whose knowledge points include `tag`.
    pub async fn list_problems(
        &self,
        subject: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Vec<ProblemSummary>, ServiceError> {
        let filter = TaskFilter {
            subject: subject.map(str::to_string),
            ..Default::default()
        };
        Ok(self
            .list(&filter)
            .await?
            .iter()
            .flat_map(Task::summaries)
            .filter(|p| tag.map_or(true, |tag| p.knowledge_points.iter().any(|k| k == tag)))
            .collect())
    }

    /// Begin processing a pending task.
    pub async fn start(&self, task_id: &str, background: bool) -> Result<Task, ServiceError> {
        self.launch(
            task_id,
            "start",
            |s| s == TaskStatus::Pending,
            RunMode::Resume,
            CancellationToken::new(),
            background,
        )
        .await
    }

    /// Ask a pending or processing task to stop.
    ///
    /// A pending task gets a run whose token is already cancelled, so it passes through
    /// `processing` to `cancelled` at its first checkpoint and publishes one `done`.
    pub async fn cancel(&self, task_id: &str) -> Result<Task, ServiceError> {
        let task = self.get(task_id).await?;
        match task.status {
            TaskStatus::Processing => {
                let token = self
                    .runs
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(task_id)
                    .cloned();
                match token {
                    Some(token) => {
                        token.cancel();
                        tracing::info!(task_id = %task_id, "Cancellation requested");
                        Ok(task)
                    }
                    None => self.cancel_orphan(task_id).await,
                }
            }
            TaskStatus::Pending => {
                let token = CancellationToken::new();
                token.cancel();
                self.launch(
                    task_id,
                    "cancel",
                    |s| s == TaskStatus::Pending,
                    RunMode::Resume,
                    token,
                    true,
                )
                .await
            }
            status => Err(ServiceError::InvalidTransition {
                action: "cancel",
                status,
            }),
        }
    }

    /// Cancel a task left `processing` without a run, e.g. after its final status could
    /// not be stored.
    async fn cancel_orphan(&self, task_id: &str) -> Result<Task, ServiceError> {
        let _slot = RunSlot::claim(&self.runs, task_id, CancellationToken::new())?;
        let (task, _) = self
            .ledger
            .update::<_, ServiceError, _>(task_id, |task| {
                if task.status != TaskStatus::Processing {
                    return Err(ServiceError::InvalidTransition {
                        action: "cancel",
                        status: task.status,
                    });
                }
                task.transition(TaskStatus::Cancelled)?;
                task.stage_message = Some("已取消".to_string());
                Ok(())
            })
            .await?;
        tracing::warn!(task_id = %task_id, "Cancelled processing task with no live run");
        Ok(task)
    }

    /// Re-run a failed or completed task.
    ///
    /// Resumes from the first problem missing an output; a task with nothing missing is
    /// recomputed, keeping human-edited problems as they are.
    pub async fn retry(
        &self,
        task_id: &str,
        clear_stream: bool,
        background: bool,
    ) -> Result<Task, ServiceError> {
        let task = self.get(task_id).await?;
        if !task.status.is_retryable() {
            return Err(ServiceError::InvalidTransition {
                action: "retry",
                status: task.status,
            });
        }
        if self.is_running(task_id) {
            return Err(ServiceError::Conflict(format!(
                "Task {} already has a run in flight",
                task_id
            )));
        }
        let mode = if task.is_fully_processed() {
            RunMode::Recompute
        } else {
            RunMode::Resume
        };
        if clear_stream {
            self.broker.reset(task_id).await?;
        }
        tracing::info!(task_id = %task_id, ?mode, clear_stream, "Retrying task");
        self.launch(
            task_id,
            "retry",
            |s| s.is_retryable(),
            mode,
            CancellationToken::new(),
            background,
        )
        .await
    }

    async fn launch(
        &self,
        task_id: &str,
        action: &'static str,
        allowed: fn(TaskStatus) -> bool,
        mode: RunMode,
        cancel: CancellationToken,
        background: bool,
    ) -> Result<Task, ServiceError> {
        let slot = RunSlot::claim(&self.runs, task_id, cancel.clone())?;

        let (task, _) = self
            .ledger
            .update::<_, ServiceError, _>(task_id, |task| {
                if !allowed(task.status) {
                    return Err(ServiceError::InvalidTransition {
                        action,
                        status: task.status,
                    });
                }
                task.transition(TaskStatus::Processing)?;
                task.last_error = None;
                task.set_stage("queued", "排队中");
                Ok(())
            })
            .await?;

        self.broker.progress(
            task_id,
            TaskStatus::Processing,
            task.stage.clone(),
            task.stage_message.clone(),
        );
        tracing::info!(task_id = %task_id, "Task run started");

        let handle = self.spawn_run(slot, mode, cancel);
        if background {
            return Ok(task);
        }
        if let Err(e) = handle.await {
            tracing::error!(task_id = %task_id, "Run supervisor failed: {}", e);
        }
        self.get(task_id).await
    }

    fn spawn_run(&self, slot: RunSlot, mode: RunMode, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let task_id = slot.task_id.clone();
        let broker = Arc::clone(&self.broker);
        let orchestrator = Arc::clone(&self.orchestrator);
        let run_id = task_id.clone();
        let inner = tokio::spawn(async move {
            let publisher = broker.publisher(&run_id).await?;
            let ctx = RunContext {
                task_id: run_id,
                mode,
                cancel,
                publisher: Some(publisher),
            };
            orchestrator.run(&ctx).await
        });

        let service = self.clone();
        tokio::spawn(async move {
            let outcome = match inner.await {
                Ok(result) => result,
                Err(join) if join.is_panic() => {
                    tracing::error!(task_id = %task_id, "Pipeline run panicked");
                    Err(PipelineError::Crashed("panic".to_string()))
                }
                Err(join) => {
                    tracing::error!(task_id = %task_id, "Pipeline run aborted: {}", join);
                    Err(PipelineError::Crashed(join.to_string()))
                }
            };
            service.complete_run(slot, outcome).await;
        })
    }

    /// Persist the terminal status, send `done`, then release the slot.
    ///
    /// The slot is held until `done` went out, so a retry cannot attach to the channel of
    /// the run that is ending. When the status cannot be stored the stream ends with
    /// `error` instead of `done` and the task stays `processing` until cancelled.
    async fn complete_run(&self, slot: RunSlot, outcome: Result<RunOutcome, PipelineError>) {
        let task_id = slot.task_id.clone();
        let (status, error) = match outcome {
            Ok(RunOutcome::Completed) => (TaskStatus::Completed, None),
            Ok(RunOutcome::Cancelled) => (TaskStatus::Cancelled, None),
            Err(e) => (TaskStatus::Failed, Some(e.to_string())),
        };

        let mut attempt = 0;
        let persisted = loop {
            attempt += 1;
            let result = self
                .ledger
                .update::<_, ServiceError, _>(&task_id, |task| {
                    task.transition(status)?;
                    let label = task
                        .stage
                        .as_deref()
                        .and_then(|s| s.parse::<Stage>().ok())
                        .map(|s| s.label())
                        .unwrap_or("处理");
                    task.stage_message = Some(match (&error, status) {
                        (Some(e), _) => format!("{}失败: {}", label, e),
                        (None, TaskStatus::Cancelled) => "已取消".to_string(),
                        _ => "已完成".to_string(),
                    });
                    task.last_error = error.clone();
                    Ok(())
                })
                .await;
            match result {
                Err(ServiceError::Store(e)) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        task_id = %task_id,
                        "Storing terminal status {} failed (attempt {}), retrying: {}",
                        status,
                        attempt,
                        e
                    );
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                }
                result => break result,
            }
        };

        match persisted {
            Ok((task, _)) => {
                match &error {
                    Some(e) => tracing::warn!(task_id = %task_id, "Task failed: {}", e),
                    None => tracing::info!(task_id = %task_id, status = %status, "Task run finished"),
                }
                self.broker.progress(
                    &task_id,
                    task.status,
                    task.stage.clone(),
                    task.stage_message.clone(),
                );
                self.broker.finish(&task_id, status).await;
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, "Failed to persist terminal status {}: {}", status, e);
                self.broker
                    .abort(&task_id, format!("failed to store final status {}: {}", status, e))
                    .await;
            }
        }

        drop(slot);
    }

    /// Replace problem fields verbatim and mark the problem edited.
    pub async fn override_problem(
        &self,
        task_id: &str,
        problem_id: &str,
        fields: ProblemOverride,
    ) -> Result<Task, ServiceError> {
        if fields.is_empty() {
            return Err(ServiceError::InvalidInput("No fields to update".to_string()));
        }
        let (task, _) = self
            .ledger
            .update::<_, ServiceError, _>(task_id, |task| {
                if task.status == TaskStatus::Pending {
                    return Err(ServiceError::InvalidTransition {
                        action: "edit",
                        status: task.status,
                    });
                }
                fields.apply_to_problem(task.problem_mut(problem_id)?);
                if fields.touches_solution() {
                    let solution = fields.apply_to_solution(problem_id, task.solution(problem_id));
                    task.put_solution(solution)?;
                }
                if fields.touches_tagging() {
                    let tagging = fields.apply_to_tagging(problem_id, task.tagging(problem_id));
                    task.put_tagging(tagging)?;
                }
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %task_id, problem_id = %problem_id, "Problem overridden");
        Ok(task)
    }

    /// Remove one problem with its outputs. A user-supplied region it came from goes too,
    /// so a later retry does not extract it again.
    pub async fn delete_problem(&self, task_id: &str, problem_id: &str) -> Result<Task, ServiceError> {
        let (task, _) = self
            .ledger
            .update::<_, ServiceError, _>(task_id, |task| {
                let removed = task.remove_problem(problem_id)?;
                if let Some(region_id) = removed.region_id {
                    let still_used = task
                        .problems
                        .iter()
                        .any(|p| p.region_id.as_deref() == Some(region_id.as_str()));
                    if !still_used {
                        task.regions.retain(|r| r.id != region_id);
                    }
                }
                Ok(())
            })
            .await?;
        tracing::info!(task_id = %task_id, problem_id = %problem_id, "Problem deleted");
        Ok(task)
    }

    /// Delete a task with its stream and traces. Rejected while a run is in flight.
    pub async fn delete_task(&self, task_id: &str) -> Result<(), ServiceError> {
        let slot = RunSlot::claim(&self.runs, task_id, CancellationToken::new()).map_err(|_| {
            ServiceError::Conflict(format!("Task {} is running; cancel it first", task_id))
        })?;
        let task = self.get(task_id).await?;
        if !self.ledger.remove(task_id).await? {
            return Err(ServiceError::NotFound(format!("Task not found: {}", task_id)));
        }
        self.broker.discard(task_id);
        if let Some(path) = &task.asset.path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::warn!(task_id = %task_id, "Failed to remove asset {}: {}", path, e);
            }
        }
        drop(slot);
        tracing::info!(task_id = %task_id, "Task deleted");
        Ok(())
    }

    /// Run a single stage for a single problem. Status is left as it is.
    pub async fn rerun_stage(&self, task_id: &str, problem_id: &str, stage: Stage) -> Result<Task, ServiceError> {
        let _slot = RunSlot::claim(&self.runs, task_id, CancellationToken::new())?;
        let task = self.get(task_id).await?;
        if task.status == TaskStatus::Pending {
            return Err(ServiceError::InvalidTransition {
                action: "rerun a stage of",
                status: task.status,
            });
        }
        Ok(self.orchestrator.rerun(task_id, problem_id, stage).await?)
    }

    /// Streamed text, capped to the last `max_chars` characters.
    pub async fn read_stream(&self, task_id: &str, max_chars: Option<usize>) -> Result<String, ServiceError> {
        self.get(task_id).await?;
        let text = self.broker.snapshot(task_id).await?;
        Ok(tail_chars(&text, max_chars.unwrap_or(self.replay_max_chars)).to_string())
    }

    pub async fn traces(&self, task_id: &str) -> Result<Vec<TraceEvent>, ServiceError> {
        self.get(task_id).await?;
        self.ledger
            .store()
            .read_traces(task_id)
            .await
            .map_err(ServiceError::Store)
    }

    /// Starting point for a live event stream.
    pub async fn events(&self, task_id: &str) -> Result<EventFeed, ServiceError> {
        let task = self.get(task_id).await?;
        if task.status.is_terminal() {
            let text = self.broker.snapshot(task_id).await?;
            return Ok(EventFeed::Finished { task, text });
        }

        let subscription = self.broker.subscribe(task_id).await?;
        let task = self.get(task_id).await?;
        if !subscription.live && task.status.is_terminal() {
            let text = subscription.snapshot;
            drop(subscription.rx);
            self.broker.close_if_unused(task_id);
            return Ok(EventFeed::Finished { task, text });
        }
        Ok(EventFeed::Live { task, subscription })
    }

    /// Release a stream channel opened by [`Self::events`] once its client left.
    pub fn release(&self, task_id: &str) {
        self.broker.close_if_unused(task_id);
    }

    /// Fail tasks left `processing` by a previous process.
    pub async fn recover_orphans(&self) -> Result<usize, ServiceError> {
        let tasks = self
            .ledger
            .store()
            .list_tasks()
            .await
            .map_err(ServiceError::Store)?;
        let mut recovered = 0;
        for task in tasks {
            if task.status != TaskStatus::Processing || self.is_running(&task.id) {
                continue;
            }
            self.ledger
                .update::<_, ServiceError, _>(&task.id, |task| {
                    task.transition(TaskStatus::Failed)?;
                    task.stage_message = Some("服务重启，处理中断".to_string());
                    task.last_error = Some("interrupted by service restart".to_string());
                    Ok(())
                })
                .await?;
            tracing::warn!(task_id = %task.id, "Recovered orphaned task as failed");
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::llm::{
        DeltaSink, ImageInput, LlmError, ModelPort, ModelReply, ModelRequest, ModelRouter, RetryConfig, StubClient,
        StubReply,
    };
    use crate::pipeline::{PipelineSettings, PromptSet, StageRunner};
    use crate::store::{InMemoryTaskStore, TaskStore};
    use crate::stream::{StreamEvent, StreamSettings};
    use crate::tags::TagStore;
    use crate::task::CallKind;

    fn service(port: Arc<dyn ModelPort>) -> TaskService {
        service_with(port, Arc::new(InMemoryTaskStore::new()))
    }

    fn service_with(port: Arc<dyn ModelPort>, store: Arc<dyn TaskStore>) -> TaskService {
        let ledger = TaskLedger::new(Arc::clone(&store));
        let runner = StageRunner::new(
            Arc::new(ModelRouter::uniform(port)),
            Arc::new(PromptSet::builtin()),
            RetryConfig::immediate(2),
            Duration::from_secs(5),
            Arc::clone(&store),
        );
        let orchestrator = PipelineOrchestrator::new(
            runner,
            ledger.clone(),
            Arc::new(TagStore::in_memory()),
            PipelineSettings::default(),
        );
        let broker = Arc::new(StreamBroker::new(
            store,
            StreamSettings {
                flush_interval: Duration::from_millis(5),
                channel_capacity: 1024,
            },
        ));
        TaskService::new(ledger, broker, Arc::new(orchestrator), 200_000)
    }

    fn asset() -> AssetRef {
        AssetRef::remote("https://example.com/homework.jpg", "image/jpeg")
    }

    fn region(id: &str) -> CropRegion {
        CropRegion {
            id: id.to_string(),
            bbox: None,
            label: None,
        }
    }

    async fn wait_terminal(service: &TaskService, task_id: &str) -> Task {
        for _ in 0..500 {
            let task = service.get(task_id).await.unwrap();
            if task.status.is_terminal() && !service.is_running(task_id) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    async fn live(service: &TaskService, task_id: &str) -> Subscription {
        match service.events(task_id).await.unwrap() {
            EventFeed::Live { subscription, .. } => subscription,
            EventFeed::Finished { task, .. } => panic!("task already {}", task.status),
        }
    }

    /// Events up to and including `done`.
    async fn collect(subscription: &mut Subscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), subscription.rx.recv()).await {
                Ok(Ok(event)) => {
                    let done = event.is_done();
                    events.push(event);
                    if done {
                        return events;
                    }
                }
                other => panic!("stream ended before done: {:?}", other),
            }
        }
    }

    fn streamed_text(snapshot: &str, events: &[StreamEvent]) -> String {
        let mut text = snapshot.to_string();
        for event in events {
            if let StreamEvent::LlmDelta { delta, .. } = event {
                text.push_str(delta);
            }
        }
        text
    }

    struct PanicPort;

    #[async_trait]
    impl ModelPort for PanicPort {
        fn model(&self) -> &str {
            "panic"
        }

        async fn structured_call(&self, _: &ModelRequest, _: Option<DeltaSink>) -> Result<ModelReply, LlmError> {
            panic!("model client bug")
        }

        async fn structured_call_with_image(
            &self,
            _: &ModelRequest,
            _: &ImageInput,
            _: Option<DeltaSink>,
        ) -> Result<ModelReply, LlmError> {
            panic!("model client bug")
        }
    }

    #[tokio::test]
    async fn test_single_problem_scenario() {
        let stub = Arc::new(StubClient::new());
        let service = service(stub.clone());
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        let mut subscription = live(&service, &task.id).await;
        let started = service.start(&task.id, true).await.unwrap();
        assert_eq!(started.status, TaskStatus::Processing);

        let events = collect(&mut subscription).await;
        let done = service.get(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.problems.len(), 1);
        assert_eq!(done.problems[0].problem_text, "求解方程 2x+3=7");
        assert_eq!(done.solutions.len(), 1);
        assert_eq!(done.solutions[0].answer, "x=2");
        assert_eq!(done.tags.len(), 1);
        assert!(done.tags[0].knowledge_points.contains(&"一元一次方程".to_string()));

        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done {
                task_id: task.id.clone(),
                status: TaskStatus::Completed
            })
        );
        let stages: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress { stage: Some(stage), .. } => Some(stage.clone()),
                _ => None,
            })
            .collect();
        for expected in ["extractor", "solver", "tagger"] {
            assert!(stages.iter().any(|s| s == expected), "missing {} in {:?}", expected, stages);
        }

        let replay = service.read_stream(&task.id, None).await.unwrap();
        assert_eq!(streamed_text(&subscription.snapshot, &events), replay);
        assert!(replay.contains("x=2"));
        assert_eq!(stub.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_blocking_start_and_illegal_edges() {
        let service = service(Arc::new(StubClient::new()));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();

        let finished = service.start(&task.id, false).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);

        let err = service.start(&task.id, true).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { action: "start", status: TaskStatus::Completed }));
        let err = service.cancel(&task.id).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);

        let missing = service.start("nope", true).await.unwrap_err();
        assert!(matches!(missing, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_between_problems_keeps_earlier_outputs() {
        let (stub, mut gate) = StubClient::new().gated();
        let stub = Arc::new(stub);
        let service = service(stub.clone());
        let task = service
            .create(asset(), TaskHints::default(), vec![region("a"), region("b")])
            .await
            .unwrap();
        service.start(&task.id, true).await.unwrap();

        // extract a, extract b, solve first problem
        for expected in 0..3 {
            assert_eq!(gate.entered().await, Some(expected));
            gate.release(1);
        }
        // tagger of the first problem is parked
        assert_eq!(gate.entered().await, Some(3));
        service.cancel(&task.id).await.unwrap();
        gate.release(1);

        let task = wait_terminal(&service, &task.id).await;
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.problems.len(), 2);
        assert_eq!(task.solutions.len(), 1);
        assert_eq!(task.tags.len(), 1);
        assert_eq!(task.solutions[0].problem_id, task.problems[0].problem_id);
        assert_eq!(stub.calls().len(), 4);

        let err = service.retry(&task.id, false, true).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { action: "retry", .. }));
    }

    #[tokio::test]
    async fn test_cancel_pending_passes_through_processing() {
        let stub = Arc::new(StubClient::new());
        let service = service(stub.clone());
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut subscription = live(&service, &task.id).await;

        service.cancel(&task.id).await.unwrap();
        let events = collect(&mut subscription).await;

        let statuses: Vec<TaskStatus> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress { status, .. } => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses.first(), Some(&TaskStatus::Processing));
        assert_eq!(statuses.last(), Some(&TaskStatus::Cancelled));
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(service.get(&task.id).await.unwrap().status, TaskStatus::Cancelled);
        assert!(stub.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_task_can_be_retried() {
        let stub = Arc::new(StubClient::scripted(vec![StubReply::Fatal("image unreadable".into())]));
        let service = service(stub.clone());
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();

        let failed = service.start(&task.id, false).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.last_error.as_deref().unwrap_or_default().contains("image unreadable"));
        assert!(failed.stage_message.as_deref().unwrap_or_default().starts_with("识别题目"));

        let retried = service.retry(&task.id, false, false).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Completed);
        assert_eq!(retried.last_error, None);
        assert_eq!(retried.problems.len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_run_is_reported_as_failed() {
        let service = service(Arc::new(PanicPort));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut subscription = live(&service, &task.id).await;

        service.start(&task.id, true).await.unwrap();
        let events = collect(&mut subscription).await;
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done {
                task_id: task.id.clone(),
                status: TaskStatus::Failed
            })
        );

        let task = wait_terminal(&service, &task.id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.last_error.unwrap().contains("panic"));
    }

    #[tokio::test]
    async fn test_truncated_solver_reply_is_retried_and_traced() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::text(r#"{"problem_text": "求解方程 2x+3=7"}"#),
            StubReply::text("```json\n{\"answer\": \"x=2\", \"explanation\": \"移项"),
            StubReply::text(r#"{"answer": "x=2", "explanation": "移项得 2x=4，所以 x=2"}"#),
        ]));
        let service = service(stub);
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();

        let done = service.start(&task.id, false).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.solutions[0].answer, "x=2");

        let traces = service.traces(&task.id).await.unwrap();
        let solver: Vec<_> = traces.iter().filter(|t| t.stage == "solver").collect();
        assert_eq!(solver.len(), 2);
        assert_eq!(solver[0].kind, CallKind::Primary);
        assert!(solver[0].error.is_some());
        assert_eq!(solver[1].kind, CallKind::SchemaRetry);
        assert!(solver[1].error.is_none());
    }

    #[tokio::test]
    async fn test_override_and_retag_leave_other_problems_alone() {
        let service = service(Arc::new(StubClient::scripted(vec![
            StubReply::text(r#"{"problem_text": "第一题"}"#),
            StubReply::text(r#"{"problem_text": "第二题"}"#),
        ])));
        let task = service
            .create(asset(), TaskHints::default(), vec![region("a"), region("b")])
            .await
            .unwrap();
        service.start(&task.id, false).await.unwrap();

        let first = service.get(&task.id).await.unwrap().problems[0].problem_id.clone();
        let second = service.get(&task.id).await.unwrap().problems[1].problem_id.clone();
        let edited = service
            .override_problem(
                &task.id,
                &first,
                ProblemOverride {
                    problem_text: Some("第一题（已订正）".into()),
                    user_tags: Some(vec!["期中".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(edited.problems[0].edited);
        assert_eq!(edited.status, TaskStatus::Completed);

        let after = service.rerun_stage(&task.id, &second, Stage::Tagger).await.unwrap();
        assert_eq!(after.problems[0], edited.problems[0]);
        assert_eq!(after.problems[1], edited.problems[1]);
        assert_eq!(after.solutions, edited.solutions);
        assert_eq!(after.tagging(&first), edited.tagging(&first));
        assert_eq!(after.status, TaskStatus::Completed);

        let empty = service
            .override_problem(&task.id, &first, ProblemOverride::default())
            .await
            .unwrap_err();
        assert!(matches!(empty, ServiceError::InvalidInput(_)));
        let unknown = service
            .override_problem(
                &task.id,
                "missing",
                ProblemOverride {
                    problem_text: Some("x".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(unknown, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_override_can_replace_solution_and_tags() {
        let service = service(Arc::new(StubClient::new()));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        service.start(&task.id, false).await.unwrap();
        let pid = service.get(&task.id).await.unwrap().problems[0].problem_id.clone();

        let task = service
            .override_problem(
                &task.id,
                &pid,
                ProblemOverride {
                    answer: Some("x = 2".into()),
                    knowledge_points: Some(vec!["等式的性质".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.solution(&pid).unwrap().answer, "x = 2");
        assert_eq!(task.tagging(&pid).unwrap().knowledge_points, vec!["等式的性质"]);
    }

    #[tokio::test]
    async fn test_pending_task_cannot_be_edited() {
        let service = service(Arc::new(StubClient::new()));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let err = service
            .override_problem(
                &task.id,
                "p",
                ProblemOverride {
                    problem_text: Some("x".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition { status: TaskStatus::Pending, .. }));
    }

    #[tokio::test]
    async fn test_running_task_rejects_delete_and_rerun() {
        let (stub, mut gate) = StubClient::new().gated();
        let service = service(Arc::new(stub));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        service.start(&task.id, true).await.unwrap();
        assert_eq!(gate.entered().await, Some(0));

        assert!(matches!(service.delete_task(&task.id).await, Err(ServiceError::Conflict(_))));
        assert!(matches!(
            service.rerun_stage(&task.id, "p", Stage::Solver).await,
            Err(ServiceError::Conflict(_))
        ));
        assert!(matches!(
            service.retry(&task.id, false, true).await,
            Err(ServiceError::InvalidTransition { .. })
        ));

        gate.release(10);
        wait_terminal(&service, &task.id).await;
        service.delete_task(&task.id).await.unwrap();
        assert!(matches!(service.get(&task.id).await, Err(ServiceError::NotFound(_))));
        assert!(matches!(service.read_stream(&task.id, None).await, Err(ServiceError::NotFound(_))));
        assert!(matches!(service.delete_task(&task.id).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_retry_of_completed_task_recomputes() {
        let stub = Arc::new(StubClient::new());
        let service = service(stub.clone());
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let first = service.start(&task.id, false).await.unwrap();
        let first_text = service.read_stream(&task.id, None).await.unwrap();
        assert!(!first_text.is_empty());

        let again = service.retry(&task.id, true, false).await.unwrap();
        assert_eq!(again.status, TaskStatus::Completed);
        assert_eq!(again.problems[0].problem_id, first.problems[0].problem_id);
        assert_eq!(stub.calls().len(), 6);
        assert_eq!(service.read_stream(&task.id, None).await.unwrap(), first_text);

        service.retry(&task.id, false, false).await.unwrap();
        let appended = service.read_stream(&task.id, None).await.unwrap();
        assert_eq!(appended, format!("{}{}", first_text, first_text));

        let tail = service.read_stream(&task.id, Some(5)).await.unwrap();
        assert_eq!(tail.chars().count(), 5);
        assert!(appended.ends_with(&tail));
    }

    #[tokio::test]
    async fn test_replay_and_resubscribe_match_uninterrupted_stream() {
        let (stub, mut gate) = StubClient::new().gated();
        let service = service(Arc::new(stub));
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut early = live(&service, &task.id).await;
        service.start(&task.id, true).await.unwrap();

        assert_eq!(gate.entered().await, Some(0));
        gate.release(1);
        assert_eq!(gate.entered().await, Some(1));
        let mut late = live(&service, &task.id).await;
        assert!(late.live);
        gate.release(10);

        let early_events = collect(&mut early).await;
        let late_events = collect(&mut late).await;
        let full = streamed_text(&early.snapshot, &early_events);
        assert_eq!(streamed_text(&late.snapshot, &late_events), full);
        assert_eq!(service.read_stream(&task.id, None).await.unwrap(), full);

        match service.events(&task.id).await.unwrap() {
            EventFeed::Finished { task, text } => {
                assert_eq!(task.status, TaskStatus::Completed);
                assert_eq!(text, full);
            }
            EventFeed::Live { .. } => panic!("finished task should not be live"),
        }
    }

    #[tokio::test]
    async fn test_delete_problem_drops_its_region() {
        let service = service(Arc::new(StubClient::new()));
        let task = service
            .create(asset(), TaskHints::default(), vec![region("a"), region("b")])
            .await
            .unwrap();
        let done = service.start(&task.id, false).await.unwrap();
        let second = done.problems[1].problem_id.clone();

        let task = service.delete_problem(&task.id, &second).await.unwrap();
        assert_eq!(task.problems.len(), 1);
        assert_eq!(task.solutions.len(), 1);
        assert_eq!(task.regions.len(), 1);
        assert!(task.is_fully_processed());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_regions() {
        let service = service(Arc::new(StubClient::new()));
        let err = service
            .create(asset(), TaskHints::default(), vec![region("a"), region("a")])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_recover_orphans_and_list_filter() {
        let service = service(Arc::new(StubClient::new()));
        let pending = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();

        let mut orphan = Task::new(asset(), TaskHints::default(), Vec::new());
        orphan.transition(TaskStatus::Processing).unwrap();
        service.ledger.insert(&orphan).await.unwrap();

        assert_eq!(service.recover_orphans().await.unwrap(), 1);
        let recovered = service.get(&orphan.id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Failed);
        assert!(recovered.last_error.is_some());

        let active = service
            .list(&TaskFilter {
                active_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, pending.id);

        let failed = service
            .list(&TaskFilter {
                status: Some(TaskStatus::Failed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    /// In-memory store with slow stream appends and a budget of failing terminal writes.
    struct HookedStore {
        inner: InMemoryTaskStore,
        append_delay: Duration,
        terminal_failures: AtomicUsize,
    }

    impl HookedStore {
        fn new(append_delay: Duration, terminal_failures: usize) -> Self {
            Self {
                inner: InMemoryTaskStore::new(),
                append_delay,
                terminal_failures: AtomicUsize::new(terminal_failures),
            }
        }
    }

    #[async_trait]
    impl TaskStore for HookedStore {
        fn is_persistent(&self) -> bool {
            false
        }

        async fn list_tasks(&self) -> Result<Vec<Task>, String> {
            self.inner.list_tasks().await
        }

        async fn get_task(&self, id: &str) -> Result<Option<Task>, String> {
            self.inner.get_task(id).await
        }

        async fn put_task(&self, task: &Task) -> Result<(), String> {
            if task.status.is_terminal()
                && self
                    .terminal_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err("disk full".to_string());
            }
            self.inner.put_task(task).await
        }

        async fn delete_task(&self, id: &str) -> Result<bool, String> {
            self.inner.delete_task(id).await
        }

        async fn append_stream(&self, id: &str, text: &str) -> Result<(), String> {
            tokio::time::sleep(self.append_delay).await;
            self.inner.append_stream(id, text).await
        }

        async fn read_stream(&self, id: &str) -> Result<String, String> {
            self.inner.read_stream(id).await
        }

        async fn clear_stream(&self, id: &str) -> Result<(), String> {
            self.inner.clear_stream(id).await
        }

        async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<(), String> {
            self.inner.append_trace(id, event).await
        }

        async fn read_traces(&self, id: &str) -> Result<Vec<TraceEvent>, String> {
            self.inner.read_traces(id).await
        }
    }

    #[tokio::test]
    async fn test_retry_waits_until_previous_done_is_sent() {
        let store = Arc::new(HookedStore::new(Duration::from_millis(40), 0));
        let service = service_with(Arc::new(StubClient::new()), store);
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut first = live(&service, &task.id).await;
        service.start(&task.id, true).await.unwrap();

        let mut rejected_while_finishing = false;
        let mut retried = false;
        for _ in 0..1000 {
            match service.retry(&task.id, false, true).await {
                Ok(_) => {
                    retried = true;
                    break;
                }
                Err(ServiceError::Conflict(_)) => rejected_while_finishing = true,
                Err(ServiceError::InvalidTransition { .. }) => {}
                Err(other) => panic!("unexpected retry error: {}", other),
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(retried);
        assert!(rejected_while_finishing);

        let events = collect(&mut first).await;
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Done {
                task_id: task.id.clone(),
                status: TaskStatus::Completed
            })
        );

        let task = wait_terminal(&service, &task.id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(first.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_terminal_write_is_retried_before_done() {
        let store = Arc::new(HookedStore::new(Duration::ZERO, 2));
        let service = service_with(Arc::new(StubClient::new()), store);
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut subscription = live(&service, &task.id).await;
        service.start(&task.id, true).await.unwrap();

        let events = collect(&mut subscription).await;
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        let task = wait_terminal(&service, &task.id).await;
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_unstored_terminal_status_aborts_stream_and_allows_cancel() {
        let store = Arc::new(HookedStore::new(Duration::ZERO, TERMINAL_WRITE_ATTEMPTS as usize));
        let service = service_with(Arc::new(StubClient::new()), store);
        let task = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        let mut subscription = live(&service, &task.id).await;
        service.start(&task.id, true).await.unwrap();

        let mut saw_error = false;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), subscription.rx.recv()).await {
                Ok(Ok(StreamEvent::Done { .. })) => panic!("done sent for an unstored status"),
                Ok(Ok(StreamEvent::Error { .. })) => saw_error = true,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
                Err(_) => panic!("stream never ended"),
            }
        }
        assert!(saw_error);

        for _ in 0..500 {
            if !service.is_running(&task.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!service.is_running(&task.id));
        assert_eq!(service.get(&task.id).await.unwrap().status, TaskStatus::Processing);

        let cancelled = service.cancel(&task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(service.get(&task.id).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_problem_library_filters_by_subject_and_tag() {
        let service = service(Arc::new(StubClient::new()));
        let math = service.create(asset(), TaskHints::default(), Vec::new()).await.unwrap();
        service.start(&math.id, false).await.unwrap();
        let physics_hints = TaskHints {
            subject: "physics".to_string(),
            ..Default::default()
        };
        let physics = service.create(asset(), physics_hints, Vec::new()).await.unwrap();
        service.start(&physics.id, false).await.unwrap();

        assert_eq!(service.list_problems(None, None).await.unwrap().len(), 2);
        let tagged = service
            .list_problems(Some("physics"), Some("一元一次方程"))
            .await
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].task_id, physics.id);
        assert!(service
            .list_problems(None, Some("三角函数"))
            .await
            .unwrap()
            .is_empty());

        let listed = service
            .list(&TaskFilter {
                subject: Some("math".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, math.id);
    }
}
