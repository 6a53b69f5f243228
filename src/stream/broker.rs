//! Per-task event channels.
//!
//! Each task with a run or a subscriber owns a [`TaskChannel`]: a bounded broadcast
//! sender, the text streamed so far, a buffer of not yet flushed deltas and a writer task
//! that appends flushed text to the store in order.
//!
//! The channel state lock is held while text is appended and the matching event is
//! broadcast, and also while a subscriber copies the text and subscribes. A snapshot
//! followed by the deltas received afterwards is therefore exactly the full text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};

use super::StreamEvent;
use crate::llm::DeltaSink;
use crate::store::{StoreError, TaskStore};
use crate::task::TaskStatus;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Deltas arriving within this window go out as one event
    pub flush_interval: Duration,
    /// Broadcast buffer; slower subscribers are dropped with an error event
    pub channel_capacity: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            channel_capacity: 1024,
        }
    }
}

enum LogOp {
    Append(String),
    Clear(oneshot::Sender<()>),
    Barrier(oneshot::Sender<()>),
}

#[derive(Default)]
struct ChannelState {
    text: String,
    pending: String,
    last_flush: Option<Instant>,
    flush_scheduled: bool,
    run_attached: bool,
    closed: bool,
}

struct TaskChannel {
    task_id: String,
    tx: broadcast::Sender<StreamEvent>,
    log_tx: mpsc::UnboundedSender<LogOp>,
    flush_interval: Duration,
    state: StdMutex<ChannelState>,
}

impl TaskChannel {
    fn spawn(task_id: &str, text: String, store: Arc<dyn TaskStore>, settings: &StreamSettings) -> Arc<Self> {
        let (tx, _) = broadcast::channel(settings.channel_capacity.max(1));
        let (log_tx, mut log_rx) = mpsc::unbounded_channel::<LogOp>();

        let id = task_id.to_string();
        tokio::spawn(async move {
            while let Some(op) = log_rx.recv().await {
                match op {
                    LogOp::Append(text) => {
                        if let Err(e) = store.append_stream(&id, &text).await {
                            tracing::warn!(task_id = %id, "Failed to append stream log: {}", e);
                        }
                    }
                    LogOp::Clear(ack) => {
                        if let Err(e) = store.clear_stream(&id).await {
                            tracing::warn!(task_id = %id, "Failed to clear stream log: {}", e);
                        }
                        let _ = ack.send(());
                    }
                    LogOp::Barrier(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });

        Arc::new(Self {
            task_id: task_id.to_string(),
            tx,
            log_tx,
            flush_interval: settings.flush_interval,
            state: StdMutex::new(ChannelState {
                text,
                ..Default::default()
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn flush_locked(&self, state: &mut ChannelState) {
        state.last_flush = Some(Instant::now());
        if state.pending.is_empty() {
            return;
        }
        let delta = std::mem::take(&mut state.pending);
        state.text.push_str(&delta);
        let _ = self.tx.send(StreamEvent::LlmDelta {
            task_id: self.task_id.clone(),
            delta: delta.clone(),
        });
        let _ = self.log_tx.send(LogOp::Append(delta));
    }

    fn flush(&self) {
        let mut state = self.lock();
        state.flush_scheduled = false;
        if !state.closed {
            self.flush_locked(&mut state);
        }
    }

    fn push_delta(self: &Arc<Self>, delta: &str) {
        if delta.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.pending.push_str(delta);

        let elapsed = state.last_flush.map(|t| t.elapsed());
        match elapsed {
            Some(elapsed) if elapsed < self.flush_interval => {
                if state.flush_scheduled {
                    return;
                }
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    self.flush_locked(&mut state);
                    return;
                };
                state.flush_scheduled = true;
                let wait = self.flush_interval - elapsed;
                let channel = Arc::clone(self);
                handle.spawn(async move {
                    tokio::time::sleep(wait).await;
                    channel.flush();
                });
            }
            _ => self.flush_locked(&mut state),
        }
    }

    fn send(&self, event: StreamEvent) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        self.flush_locked(&mut state);
        let _ = self.tx.send(event);
    }

    /// Resolves once every append queued so far reached the store.
    async fn barrier(&self) {
        let (ack, done) = oneshot::channel();
        if self.log_tx.send(LogOp::Barrier(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Handle a run uses to publish into its task's channel.
#[derive(Clone)]
pub struct StreamPublisher {
    channel: Arc<TaskChannel>,
}

impl StreamPublisher {
    pub fn task_id(&self) -> &str {
        &self.channel.task_id
    }

    /// Sink for model deltas; never blocks.
    pub fn delta_sink(&self) -> DeltaSink {
        let channel = Arc::clone(&self.channel);
        Arc::new(move |delta: &str| channel.push_delta(delta))
    }

    /// Flush pending deltas, then publish a progress event.
    pub fn progress(&self, status: TaskStatus, stage: Option<String>, message: Option<String>) {
        self.channel.send(StreamEvent::progress(
            &self.channel.task_id,
            status,
            stage,
            message,
        ));
    }
}

/// What a new subscriber starts from.
pub struct Subscription {
    /// Text streamed before `rx` was attached
    pub snapshot: String,
    pub rx: broadcast::Receiver<StreamEvent>,
    /// A run is attached and will still send `done` on `rx`
    pub live: bool,
}

pub struct StreamBroker {
    store: Arc<dyn TaskStore>,
    settings: StreamSettings,
    channels: StdMutex<HashMap<String, Arc<TaskChannel>>>,
}

impl StreamBroker {
    pub fn new(store: Arc<dyn TaskStore>, settings: StreamSettings) -> Self {
        Self {
            store,
            settings,
            channels: StdMutex::new(HashMap::new()),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Arc<TaskChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open channel for the task. A channel that already sent `done` is never handed out.
    fn existing(&self, task_id: &str) -> Option<Arc<TaskChannel>> {
        self.channels()
            .get(task_id)
            .filter(|channel| !channel.lock().closed)
            .cloned()
    }

    /// Existing open channel, or a new one seeded from the stream log.
    async fn channel(&self, task_id: &str) -> Result<Arc<TaskChannel>, StoreError> {
        if let Some(channel) = self.existing(task_id) {
            return Ok(channel);
        }
        let text = self
            .store
            .read_stream(task_id)
            .await
            .map_err(StoreError::Backend)?;
        let mut channels = self.channels();
        if let Some(current) = channels.get(task_id) {
            if !current.lock().closed {
                return Ok(Arc::clone(current));
            }
        }
        let channel = TaskChannel::spawn(task_id, text, Arc::clone(&self.store), &self.settings);
        channels.insert(task_id.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Attach a run to the task's channel.
    pub async fn publisher(&self, task_id: &str) -> Result<StreamPublisher, StoreError> {
        let channel = self.channel(task_id).await?;
        channel.lock().run_attached = true;
        Ok(StreamPublisher { channel })
    }

    /// Snapshot and receiver taken atomically.
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, StoreError> {
        let channel = self.channel(task_id).await?;
        let state = channel.lock();
        Ok(Subscription {
            snapshot: state.text.clone(),
            rx: channel.tx.subscribe(),
            live: state.run_attached && !state.closed,
        })
    }

    /// Publish progress if anything listens to the task.
    pub fn progress(&self, task_id: &str, status: TaskStatus, stage: Option<String>, message: Option<String>) {
        if let Some(channel) = self.existing(task_id) {
            channel.send(StreamEvent::progress(task_id, status, stage, message));
        }
    }

    /// Full streamed text, including deltas not yet written to the log.
    pub async fn snapshot(&self, task_id: &str) -> Result<String, StoreError> {
        if let Some(channel) = self.existing(task_id) {
            let mut state = channel.lock();
            channel.flush_locked(&mut state);
            return Ok(state.text.clone());
        }
        self.store
            .read_stream(task_id)
            .await
            .map_err(StoreError::Backend)
    }

    /// Truncate the task's stream text and log.
    pub async fn reset(&self, task_id: &str) -> Result<(), StoreError> {
        let Some(channel) = self.existing(task_id) else {
            return self
                .store
                .clear_stream(task_id)
                .await
                .map_err(StoreError::Backend);
        };
        let (ack, done) = oneshot::channel();
        {
            let mut state = channel.lock();
            state.text.clear();
            state.pending.clear();
            let _ = channel.log_tx.send(LogOp::Clear(ack));
        }
        done.await
            .map_err(|_| StoreError::Backend("stream writer stopped".to_string()))
    }

    /// End the run: flush, wait for the log, then send `done` exactly once.
    ///
    /// Returns false when there was no open channel for the task.
    pub async fn finish(&self, task_id: &str, status: TaskStatus) -> bool {
        let Some(channel) = self.existing(task_id) else {
            return false;
        };
        channel.flush();
        channel.barrier().await;

        {
            let mut channels = self.channels();
            if channels
                .get(task_id)
                .is_some_and(|current| Arc::ptr_eq(current, &channel))
            {
                channels.remove(task_id);
            }
        }

        let mut state = channel.lock();
        if state.closed {
            return false;
        }
        channel.flush_locked(&mut state);
        state.closed = true;
        let _ = channel.tx.send(StreamEvent::Done {
            task_id: task_id.to_string(),
            status,
        });
        tracing::debug!(task_id = %task_id, status = %status, "Stream finished");
        true
    }

    /// End the run's channel without `done`: flush, wait for the log, then send `error`.
    ///
    /// Used when the terminal status could not be stored, so subscribers do not see a
    /// `done` that disagrees with the stored task.
    pub async fn abort(&self, task_id: &str, message: String) -> bool {
        let Some(channel) = self.existing(task_id) else {
            return false;
        };
        channel.flush();
        channel.barrier().await;

        {
            let mut channels = self.channels();
            if channels
                .get(task_id)
                .is_some_and(|current| Arc::ptr_eq(current, &channel))
            {
                channels.remove(task_id);
            }
        }

        let mut state = channel.lock();
        if state.closed {
            return false;
        }
        channel.flush_locked(&mut state);
        state.closed = true;
        let _ = channel.tx.send(StreamEvent::Error {
            message: Some(message),
        });
        tracing::warn!(task_id = %task_id, "Stream aborted without done");
        true
    }

    /// Drop the task's channel; subscribers get an error and their stream ends.
    pub fn discard(&self, task_id: &str) {
        let Some(channel) = self.channels().remove(task_id) else {
            return;
        };
        let mut state = channel.lock();
        state.closed = true;
        let _ = channel.tx.send(StreamEvent::Error {
            message: Some("task deleted".to_string()),
        });
    }

    /// Drop a channel nobody listens to and no run uses.
    pub fn close_if_unused(&self, task_id: &str) {
        let mut channels = self.channels();
        let unused = channels.get(task_id).is_some_and(|channel| {
            let state = channel.lock();
            !state.run_attached && channel.tx.receiver_count() == 0
        });
        if unused {
            channels.remove(task_id);
        }
    }

    #[cfg(test)]
    fn open_channels(&self) -> usize {
        self.channels().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryTaskStore;

    fn broker(store: Arc<dyn TaskStore>, flush: Duration) -> StreamBroker {
        StreamBroker::new(
            store,
            StreamSettings {
                flush_interval: flush,
                channel_capacity: 64,
            },
        )
    }

    fn drain(rx: &mut broadcast::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn deltas(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::LlmDelta { delta, .. } => Some(delta.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_deltas_coalesce_within_interval() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(Arc::clone(&store), Duration::from_secs(5));
        let publisher = broker.publisher("t1").await.unwrap();
        let mut sub = broker.subscribe("t1").await.unwrap();
        let sink = publisher.delta_sink();

        for piece in ["求", "解", "方", "程"] {
            sink(piece);
        }
        assert!(broker.finish("t1", TaskStatus::Completed).await);

        let events = drain(&mut sub.rx);
        assert_eq!(deltas(&events), vec!["求", "解方程"]);
        assert!(events.last().unwrap().is_done());
        assert_eq!(store.read_stream("t1").await.unwrap(), "求解方程");
    }

    #[tokio::test]
    async fn test_progress_flushes_pending_deltas_first() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(store, Duration::from_secs(5));
        let publisher = broker.publisher("t1").await.unwrap();
        let mut sub = broker.subscribe("t1").await.unwrap();
        let sink = publisher.delta_sink();

        sink("a");
        sink("b");
        publisher.progress(TaskStatus::Processing, Some("tagger".into()), None);

        let events = drain(&mut sub.rx);
        let names: Vec<&str> = events.iter().map(|e| e.event_name()).collect();
        assert_eq!(names, vec!["llm_delta", "llm_delta", "progress"]);
    }

    #[tokio::test]
    async fn test_snapshot_plus_live_equals_full_text() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        store.append_stream("t1", "earlier run|").await.unwrap();
        let broker = broker(Arc::clone(&store), Duration::ZERO);
        let publisher = broker.publisher("t1").await.unwrap();
        let sink = publisher.delta_sink();

        let mut first = broker.subscribe("t1").await.unwrap();
        sink("one ");
        sink("two ");
        let mut second = broker.subscribe("t1").await.unwrap();
        assert!(second.live);
        sink("three");
        broker.finish("t1", TaskStatus::Completed).await;

        let full = format!("{}{}", first.snapshot, deltas(&drain(&mut first.rx)).concat());
        let resumed = format!("{}{}", second.snapshot, deltas(&drain(&mut second.rx)).concat());
        assert_eq!(full, "earlier run|one two three");
        assert_eq!(resumed, full);
        assert_eq!(store.read_stream("t1").await.unwrap(), full);
    }

    #[tokio::test]
    async fn test_done_sent_once_and_channel_released() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(store, Duration::ZERO);
        let _publisher = broker.publisher("t1").await.unwrap();
        let mut sub = broker.subscribe("t1").await.unwrap();

        assert!(broker.finish("t1", TaskStatus::Failed).await);
        assert!(!broker.finish("t1", TaskStatus::Failed).await);
        assert_eq!(broker.open_channels(), 0);

        let done: Vec<_> = drain(&mut sub.rx).into_iter().filter(|e| e.is_done()).collect();
        assert_eq!(done.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_text_and_log() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(Arc::clone(&store), Duration::ZERO);
        let publisher = broker.publisher("t1").await.unwrap();
        (publisher.delta_sink())("old text");
        broker.reset("t1").await.unwrap();

        assert_eq!(broker.snapshot("t1").await.unwrap(), "");
        assert_eq!(store.read_stream("t1").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_closed_channel_is_replaced_for_next_run() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(Arc::clone(&store), Duration::ZERO);
        let first = broker.publisher("t1").await.unwrap();
        (first.delta_sink())("first ");
        assert!(broker.finish("t1", TaskStatus::Failed).await);

        let mut sub = broker.subscribe("t1").await.unwrap();
        assert_eq!(sub.snapshot, "first ");
        let second = broker.publisher("t1").await.unwrap();
        (second.delta_sink())("second");
        // A late publish on the finished channel goes nowhere.
        (first.delta_sink())("stale");
        assert!(broker.finish("t1", TaskStatus::Completed).await);

        let events = drain(&mut sub.rx);
        assert_eq!(deltas(&events), vec!["second"]);
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert_eq!(store.read_stream("t1").await.unwrap(), "first second");
    }

    #[tokio::test]
    async fn test_abort_sends_error_without_done() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(Arc::clone(&store), Duration::from_secs(5));
        let publisher = broker.publisher("t1").await.unwrap();
        let mut sub = broker.subscribe("t1").await.unwrap();
        (publisher.delta_sink())("partial");

        assert!(broker.abort("t1", "status not stored".to_string()).await);
        assert!(!broker.finish("t1", TaskStatus::Completed).await);
        assert_eq!(broker.open_channels(), 0);

        let events = drain(&mut sub.rx);
        assert!(!events.iter().any(|e| e.is_done()));
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(store.read_stream("t1").await.unwrap(), "partial");
    }

    #[tokio::test]
    async fn test_idle_subscriber_channel_is_released() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let broker = broker(store, Duration::ZERO);
        let sub = broker.subscribe("t1").await.unwrap();
        assert!(!sub.live);
        drop(sub);
        broker.close_if_unused("t1");
        assert_eq!(broker.open_channels(), 0);
    }
}
