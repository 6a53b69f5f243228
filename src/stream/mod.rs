//! Live task events.
//!
//! [`StreamBroker`] fans events out to SSE subscribers and mirrors model text into the
//! task's stream log so a reconnecting client can replay it.

mod broker;

pub use broker::{StreamBroker, StreamPublisher, StreamSettings, Subscription};

use serde::Serialize;

use crate::task::TaskStatus;

/// An event on a task's stream. Serialized as the SSE data payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Everything streamed so far, sent once when a client attaches
    LlmSnapshot { task_id: String, text: String },
    /// Text appended since the previous delta
    LlmDelta { task_id: String, delta: String },
    /// Last event of a run; the status is already persisted
    Done { task_id: String, status: TaskStatus },
    /// Transport-level problem; the client should re-read the task
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl StreamEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::LlmSnapshot { .. } => "llm_snapshot",
            StreamEvent::LlmDelta { .. } => "llm_delta",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn progress(
        task_id: &str,
        status: TaskStatus,
        stage: Option<String>,
        message: Option<String>,
    ) -> Self {
        StreamEvent::Progress {
            task_id: task_id.to_string(),
            status,
            stage,
            message,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }
}
