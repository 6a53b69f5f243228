//! Output schemas of the three stages.
//!
//! Unknown fields are ignored everywhere. Required fields: Extractor `problem_text`;
//! Solver `answer` and `explanation`; Tagger nothing.

use serde_json::{Map, Value};

use super::json::{lenient_list, lenient_string};
use super::Stage;
use crate::task::{OptionItem, TaggingResult};
use crate::util::merge_tags;

/// Schema and fallback policy of one stage.
pub trait StageSpec: Send + Sync {
    type Output: Send;

    fn stage(&self) -> Stage;

    /// Turn a decoded object into the stage output or explain what is missing.
    fn validate(&self, object: Map<String, Value>) -> Result<Self::Output, String>;

    /// Result to use once the strict retry also failed. `None` makes the failure terminal.
    fn degraded(&self) -> Option<Self::Output> {
        None
    }
}

fn required_string(object: &Map<String, Value>, field: &str) -> Result<String, String> {
    lenient_string(object.get(field)).ok_or_else(|| format!("missing required field `{}`", field))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedProblem {
    pub problem_text: String,
    pub latex_blocks: Vec<String>,
    pub options: Vec<OptionItem>,
    pub ocr_text: Option<String>,
    pub question_type: Option<String>,
}

pub struct ExtractorSpec;

impl ExtractorSpec {
    fn options(value: Option<&Value>) -> Vec<OptionItem> {
        let Some(Value::Array(items)) = value else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::Object(o) => {
                    let key = lenient_string(o.get("key"))?;
                    let text = lenient_string(o.get("text")).unwrap_or_default();
                    Some(OptionItem {
                        key,
                        text,
                        latex_blocks: lenient_list(o.get("latex_blocks")),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

impl StageSpec for ExtractorSpec {
    type Output = ExtractedProblem;

    fn stage(&self) -> Stage {
        Stage::Extractor
    }

    fn validate(&self, object: Map<String, Value>) -> Result<ExtractedProblem, String> {
        Ok(ExtractedProblem {
            problem_text: required_string(&object, "problem_text")?,
            latex_blocks: lenient_list(object.get("latex_blocks")),
            options: Self::options(object.get("options")),
            ocr_text: lenient_string(object.get("ocr_text")),
            question_type: lenient_string(object.get("question_type")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolvedProblem {
    pub answer: String,
    pub explanation: String,
    pub short_answer: Option<String>,
}

pub struct SolverSpec;

impl StageSpec for SolverSpec {
    type Output = SolvedProblem;

    fn stage(&self) -> Stage {
        Stage::Solver
    }

    fn validate(&self, object: Map<String, Value>) -> Result<SolvedProblem, String> {
        Ok(SolvedProblem {
            answer: required_string(&object, "answer")?,
            explanation: required_string(&object, "explanation")?,
            short_answer: lenient_string(object.get("short_answer")),
        })
    }
}

/// Tags the user attached at upload; they always survive tagging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequiredTags {
    pub knowledge: Vec<String>,
    pub error: Vec<String>,
}

pub struct TaggerSpec {
    pub problem_id: String,
    pub required: RequiredTags,
}

impl TaggerSpec {
    fn with_required(&self, mut result: TaggingResult) -> TaggingResult {
        result.knowledge_points = merge_tags(&self.required.knowledge, &result.knowledge_points);
        result.error_hypothesis = merge_tags(&self.required.error, &result.error_hypothesis);
        result
    }
}

impl StageSpec for TaggerSpec {
    type Output = TaggingResult;

    fn stage(&self) -> Stage {
        Stage::Tagger
    }

    fn validate(&self, object: Map<String, Value>) -> Result<TaggingResult, String> {
        Ok(self.with_required(TaggingResult {
            problem_id: self.problem_id.clone(),
            knowledge_points: lenient_list(object.get("knowledge_points")),
            question_type: lenient_string(object.get("question_type")),
            skills: lenient_list(object.get("skills")),
            error_hypothesis: lenient_list(object.get("error_hypothesis")),
            recommended_actions: lenient_list(object.get("recommended_actions")),
        }))
    }

    fn degraded(&self) -> Option<TaggingResult> {
        Some(self.with_required(TaggingResult::empty(&self.problem_id)))
    }
}
