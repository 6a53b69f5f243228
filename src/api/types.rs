//! API request and response types.

use serde::{Deserialize, Serialize};

use crate::task::{CropRegion, TaskHints};

fn default_true() -> bool {
    true
}

/// Request to submit a new exercise image.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    /// Remote image location; mutually exclusive with `image_base64`
    #[serde(default)]
    pub image_url: Option<String>,

    /// Inline image, raw base64 or a `data:` URL
    #[serde(default)]
    pub image_base64: Option<String>,

    /// Defaults to the data URL prefix, then `image/jpeg`
    #[serde(default)]
    pub mime_type: Option<String>,

    #[serde(default)]
    pub hints: TaskHints,

    /// User-drawn crop regions; empty means the whole image is one problem
    #[serde(default)]
    pub regions: Vec<CropRegion>,

    /// Start processing right after creation
    #[serde(default)]
    pub auto_start: bool,

    /// With `auto_start`, return immediately instead of waiting for the run
    #[serde(default = "default_true")]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    pub subject: Option<String>,
}

/// Options of a multipart image upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadQuery {
    /// Start processing once the task is created
    #[serde(default = "default_true")]
    pub auto_process: bool,
    #[serde(default = "default_true")]
    pub background: bool,
}

impl Default for UploadQuery {
    fn default() -> Self {
        Self {
            auto_process: true,
            background: true,
        }
    }
}

/// Problem library filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProblemsQuery {
    pub subject: Option<String>,
    /// Knowledge point the problem must carry
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessQuery {
    #[serde(default = "default_true")]
    pub background: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryQuery {
    /// Drop the accumulated stream text before the new run
    #[serde(default)]
    pub clear_stream: bool,
    #[serde(default = "default_true")]
    pub background: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamQuery {
    pub max_chars: Option<usize>,
}

/// Stage to recompute for one problem: `extractor`, `solver` or `tagger`.
#[derive(Debug, Clone, Deserialize)]
pub struct RerunRequest {
    pub stage: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagsQuery {
    pub dimension: Option<String>,
}

/// Replayed stream text.
#[derive(Debug, Clone, Serialize)]
pub struct StreamTextResponse {
    pub task_id: String,
    pub text: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
