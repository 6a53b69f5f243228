//! Per-problem records produced by the pipeline stages.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One answer option of a multiple-choice problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub key: String,
    pub text: String,
    #[serde(default)]
    pub latex_blocks: Vec<String>,
}

/// One problem flattened out of its task for the problem library.
///
/// `knowledge_points` is the manual knowledge tags followed by the tagger's points,
/// deduplicated case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemSummary {
    pub task_id: String,
    pub problem_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    pub problem_text: String,
    pub options: Vec<OptionItem>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub knowledge_points: Vec<String>,
    pub knowledge_tags: Vec<String>,
    pub error_tags: Vec<String>,
    pub user_tags: Vec<String>,
    pub updated_at: String,
}

/// A problem recognised from one region of the uploaded image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub problem_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub problem_text: String,
    #[serde(default)]
    pub latex_blocks: Vec<String>,
    #[serde(default)]
    pub options: Vec<OptionItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub knowledge_tags: Vec<String>,
    #[serde(default)]
    pub error_tags: Vec<String>,
    #[serde(default)]
    pub user_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_bbox: Option<[f64; 4]>,
    /// Set once a human edited the problem; automatic stages leave it alone.
    #[serde(default)]
    pub edited: bool,
}

impl Problem {
    pub fn new(region_id: impl Into<String>, problem_text: impl Into<String>) -> Self {
        Self {
            problem_id: Uuid::new_v4().simple().to_string(),
            region_id: Some(region_id.into()),
            question_no: None,
            question_type: None,
            source: None,
            problem_text: problem_text.into(),
            latex_blocks: Vec::new(),
            options: Vec::new(),
            ocr_text: None,
            knowledge_tags: Vec::new(),
            error_tags: Vec::new(),
            user_tags: Vec::new(),
            crop_bbox: None,
            edited: false,
        }
    }

    /// Render the options as `A. text` lines for prompts.
    pub fn options_text(&self) -> String {
        self.options
            .iter()
            .map(|o| format!("{}. {}", o.key, o.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub problem_id: String,
    pub answer: String,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_answer: Option<String>,
}

impl Solution {
    pub fn new(problem_id: &str, answer: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            problem_id: problem_id.to_string(),
            answer: answer.into(),
            explanation: explanation.into(),
            short_answer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggingResult {
    pub problem_id: String,
    #[serde(default)]
    pub knowledge_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_type: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub error_hypothesis: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

impl TaggingResult {
    /// Minimal result used when the tagger output cannot be parsed.
    pub fn empty(problem_id: &str) -> Self {
        Self {
            problem_id: problem_id.to_string(),
            knowledge_points: Vec::new(),
            question_type: None,
            skills: Vec::new(),
            error_hypothesis: Vec::new(),
            recommended_actions: Vec::new(),
        }
    }
}

/// Human edit of a problem. `None` leaves a field untouched; `Some` replaces it verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProblemOverride {
    pub question_no: Option<String>,
    pub question_type: Option<String>,
    pub source: Option<String>,
    pub problem_text: Option<String>,
    pub latex_blocks: Option<Vec<String>>,
    pub options: Option<Vec<OptionItem>>,
    pub knowledge_tags: Option<Vec<String>>,
    pub error_tags: Option<Vec<String>>,
    pub user_tags: Option<Vec<String>>,
    pub answer: Option<String>,
    pub explanation: Option<String>,
    pub short_answer: Option<String>,
    pub knowledge_points: Option<Vec<String>>,
    pub error_hypothesis: Option<Vec<String>>,
    pub recommended_actions: Option<Vec<String>>,
}

impl ProblemOverride {
    pub fn is_empty(&self) -> bool {
        self.question_no.is_none()
            && self.question_type.is_none()
            && self.source.is_none()
            && self.problem_text.is_none()
            && self.latex_blocks.is_none()
            && self.options.is_none()
            && self.knowledge_tags.is_none()
            && self.error_tags.is_none()
            && self.user_tags.is_none()
            && !self.touches_solution()
            && !self.touches_tagging()
    }

    pub fn touches_solution(&self) -> bool {
        self.answer.is_some() || self.explanation.is_some() || self.short_answer.is_some()
    }

    pub fn touches_tagging(&self) -> bool {
        self.knowledge_points.is_some()
            || self.error_hypothesis.is_some()
            || self.recommended_actions.is_some()
    }

    /// Apply the problem-level fields and mark the problem edited.
    pub fn apply_to_problem(&self, problem: &mut Problem) {
        if let Some(v) = &self.question_no {
            problem.question_no = Some(v.clone());
        }
        if let Some(v) = &self.question_type {
            problem.question_type = Some(v.clone());
        }
        if let Some(v) = &self.source {
            problem.source = Some(v.clone());
        }
        if let Some(v) = &self.problem_text {
            problem.problem_text = v.clone();
        }
        if let Some(v) = &self.latex_blocks {
            problem.latex_blocks = v.clone();
        }
        if let Some(v) = &self.options {
            problem.options = v.clone();
        }
        if let Some(v) = &self.knowledge_tags {
            problem.knowledge_tags = v.clone();
        }
        if let Some(v) = &self.error_tags {
            problem.error_tags = v.clone();
        }
        if let Some(v) = &self.user_tags {
            problem.user_tags = v.clone();
        }
        problem.edited = true;
    }

    /// Apply solution fields, creating the entry if the problem has none yet.
    pub fn apply_to_solution(&self, problem_id: &str, current: Option<&Solution>) -> Solution {
        let mut solution = current
            .cloned()
            .unwrap_or_else(|| Solution::new(problem_id, "", ""));
        if let Some(v) = &self.answer {
            solution.answer = v.clone();
        }
        if let Some(v) = &self.explanation {
            solution.explanation = v.clone();
        }
        if let Some(v) = &self.short_answer {
            solution.short_answer = Some(v.clone());
        }
        solution
    }

    pub fn apply_to_tagging(&self, problem_id: &str, current: Option<&TaggingResult>) -> TaggingResult {
        let mut tagging = current
            .cloned()
            .unwrap_or_else(|| TaggingResult::empty(problem_id));
        if let Some(v) = &self.knowledge_points {
            tagging.knowledge_points = v.clone();
        }
        if let Some(v) = &self.error_hypothesis {
            tagging.error_hypothesis = v.clone();
        }
        if let Some(v) = &self.recommended_actions {
            tagging.recommended_actions = v.clone();
        }
        if let Some(v) = &self.question_type {
            tagging.question_type = Some(v.clone());
        }
        tagging
    }
}
