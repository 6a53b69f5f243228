use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// Why a model call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Primary,
    TransientRetry,
    SchemaRetry,
}

/// One model invocation, appended to the task's trace log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: String,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem_id: Option<String>,
    pub stage: String,
    pub model: String,
    pub attempt: u32,
    pub kind: CallKind,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
