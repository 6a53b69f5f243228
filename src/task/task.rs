//! Task record and its status state machine.
//!
//! # Invariants
//! - `problems`, `solutions` and `tags` are keyed by `problem_id`
//! - a solution or tag entry exists only for a problem present in `problems`
//! - `status` only moves along the edges accepted by [`TaskStatus::can_transition_to`]

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::problem::{Problem, ProblemSummary, Solution, TaggingResult};
use crate::util::{merge_tags, now_string};

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending -> Processing -> Completed
///                      \-> Failed
///                      \-> Cancelled
/// Completed | Failed -> Processing   (retry)
/// ```
///
/// `Cancelled` is final: cancellation is intentional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet started
    Pending,
    /// A background run owns the task
    Processing,
    /// Every problem went through every stage
    Completed,
    /// A stage failed terminally or the run crashed
    Failed,
    /// Stopped at a cancellation checkpoint
    Cancelled,
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    ///
    /// # Property
    /// `is_terminal() => !is_active()`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Check if the task may still make progress without a retry.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// Whether `retry` may re-arm a task in this state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// The only legal edges of the state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, Processing)
                | (Failed, Processing)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// Errors raised by task-level invariants.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Problem not found: {0}")]
    ProblemNotFound(String),
}

/// Reference to the uploaded image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetRef {
    pub asset_id: String,
    /// Local path of the stored blob, if the upload was kept on disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Remote reference when the client only sent a URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub mime_type: String,
}

impl AssetRef {
    pub fn remote(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            asset_id: Uuid::new_v4().simple().to_string(),
            path: None,
            url: Some(url.into()),
            mime_type: mime_type.into(),
        }
    }

    pub fn stored(asset_id: String, path: String, mime_type: impl Into<String>) -> Self {
        Self {
            asset_id,
            path: Some(path),
            url: None,
            mime_type: mime_type.into(),
        }
    }
}

/// Upload-time metadata supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHints {
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub knowledge_tags: Vec<String>,
    #[serde(default)]
    pub error_tags: Vec<String>,
    #[serde(default)]
    pub user_tags: Vec<String>,
}

fn default_subject() -> String {
    "math".to_string()
}

impl Default for TaskHints {
    fn default() -> Self {
        Self {
            subject: default_subject(),
            grade: None,
            notes: None,
            question_no: None,
            source: None,
            knowledge_tags: Vec::new(),
            error_tags: Vec::new(),
            user_tags: Vec::new(),
        }
    }
}

/// A crop region of the uploaded image that holds one problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    pub id: String,
    /// Normalized `[x, y, width, height]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl CropRegion {
    /// The implicit region covering the whole image.
    pub fn whole_image() -> Self {
        Self {
            id: "full".to_string(),
            bbox: None,
            label: Some("full".to_string()),
        }
    }
}

/// One uploaded exercise image and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    /// Name of the current or most recent stage
    #[serde(default)]
    pub stage: Option<String>,
    /// Human-readable progress line
    #[serde(default)]
    pub stage_message: Option<String>,
    pub asset: AssetRef,
    #[serde(default)]
    pub hints: TaskHints,
    /// Empty means one implicit whole-image region
    #[serde(default)]
    pub regions: Vec<CropRegion>,
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
    #[serde(default)]
    pub tags: Vec<TaggingResult>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Create a new pending task.
    ///
    /// # Postconditions
    /// - `status == Pending`
    /// - `problems`, `solutions`, `tags` are empty
    pub fn new(asset: AssetRef, hints: TaskHints, regions: Vec<CropRegion>) -> Self {
        let now = now_string();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            status: TaskStatus::Pending,
            stage: None,
            stage_message: None,
            asset,
            hints,
            regions,
            problems: Vec::new(),
            solutions: Vec::new(),
            tags: Vec::new(),
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Move to `next` if the edge is legal.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn set_stage(&mut self, stage: impl Into<String>, message: impl Into<String>) {
        self.stage = Some(stage.into());
        self.stage_message = Some(message.into());
    }

    /// Regions to extract, falling back to the whole image.
    pub fn effective_regions(&self) -> Vec<CropRegion> {
        if self.regions.is_empty() {
            vec![CropRegion::whole_image()]
        } else {
            self.regions.clone()
        }
    }

    pub fn problem(&self, problem_id: &str) -> Option<&Problem> {
        self.problems.iter().find(|p| p.problem_id == problem_id)
    }

    pub fn problem_mut(&mut self, problem_id: &str) -> Result<&mut Problem, TaskError> {
        self.problems
            .iter_mut()
            .find(|p| p.problem_id == problem_id)
            .ok_or_else(|| TaskError::ProblemNotFound(problem_id.to_string()))
    }

    pub fn solution(&self, problem_id: &str) -> Option<&Solution> {
        self.solutions.iter().find(|s| s.problem_id == problem_id)
    }

    pub fn tagging(&self, problem_id: &str) -> Option<&TaggingResult> {
        self.tags.iter().find(|t| t.problem_id == problem_id)
    }

    /// Library view of every problem, in task order.
    pub fn summaries(&self) -> Vec<ProblemSummary> {
        self.problems
            .iter()
            .map(|problem| {
                let tagging = self.tagging(&problem.problem_id);
                let ai_points = tagging.map(|t| t.knowledge_points.as_slice()).unwrap_or_default();
                ProblemSummary {
                    task_id: self.id.clone(),
                    problem_id: problem.problem_id.clone(),
                    question_no: problem.question_no.clone(),
                    question_type: problem
                        .question_type
                        .clone()
                        .or_else(|| tagging.and_then(|t| t.question_type.clone())),
                    problem_text: problem.problem_text.clone(),
                    options: problem.options.clone(),
                    subject: self.hints.subject.clone(),
                    grade: self.hints.grade.clone(),
                    source: problem.source.clone().or_else(|| self.hints.source.clone()),
                    knowledge_points: merge_tags(&problem.knowledge_tags, ai_points),
                    knowledge_tags: problem.knowledge_tags.clone(),
                    error_tags: problem.error_tags.clone(),
                    user_tags: problem.user_tags.clone(),
                    updated_at: self.updated_at.clone(),
                }
            })
            .collect()
    }

    /// Insert or replace the solution of an existing problem.
    pub fn put_solution(&mut self, solution: Solution) -> Result<(), TaskError> {
        if self.problem(&solution.problem_id).is_none() {
            return Err(TaskError::ProblemNotFound(solution.problem_id));
        }
        match self
            .solutions
            .iter_mut()
            .find(|s| s.problem_id == solution.problem_id)
        {
            Some(slot) => *slot = solution,
            None => self.solutions.push(solution),
        }
        Ok(())
    }

    /// Insert or replace the tagging result of an existing problem.
    pub fn put_tagging(&mut self, tagging: TaggingResult) -> Result<(), TaskError> {
        if self.problem(&tagging.problem_id).is_none() {
            return Err(TaskError::ProblemNotFound(tagging.problem_id));
        }
        match self
            .tags
            .iter_mut()
            .find(|t| t.problem_id == tagging.problem_id)
        {
            Some(slot) => *slot = tagging,
            None => self.tags.push(tagging),
        }
        Ok(())
    }

    /// Remove a problem together with its solution and tags.
    pub fn remove_problem(&mut self, problem_id: &str) -> Result<Problem, TaskError> {
        let idx = self
            .problems
            .iter()
            .position(|p| p.problem_id == problem_id)
            .ok_or_else(|| TaskError::ProblemNotFound(problem_id.to_string()))?;
        self.solutions.retain(|s| s.problem_id != problem_id);
        self.tags.retain(|t| t.problem_id != problem_id);
        Ok(self.problems.remove(idx))
    }

    /// Index of the first problem still missing a solution or tags.
    pub fn first_incomplete(&self) -> Option<usize> {
        self.problems.iter().position(|p| {
            self.solution(&p.problem_id).is_none() || self.tagging(&p.problem_id).is_none()
        })
    }

    /// True when extraction covered every region and every problem has all outputs.
    pub fn is_fully_processed(&self) -> bool {
        let regions = self.effective_regions();
        let extracted = regions.iter().all(|r| {
            self.problems
                .iter()
                .any(|p| p.region_id.as_deref() == Some(r.id.as_str()))
        });
        extracted && !self.problems.is_empty() && self.first_incomplete().is_none()
    }

    pub fn touch(&mut self) {
        self.updated_at = now_string();
    }
}
