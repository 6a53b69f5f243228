//! The processing pipeline: Extractor (OCR), Solver, Tagger.
//!
//! - [`prompt`] renders `SYSTEM:`/`USER:` templates
//! - [`json`] pulls a JSON object out of free-form model text
//! - [`stage`] runs one model call with validation and retry policy
//! - [`stages`] defines the three stage schemas
//! - [`orchestrator`] sequences stages over a task's problems

pub mod json;
pub mod orchestrator;
pub mod prompt;
pub mod stage;
pub mod stages;

pub use orchestrator::{PipelineError, PipelineOrchestrator, PipelineSettings, RunContext, RunMode, RunOutcome};
pub use prompt::{PromptContext, PromptSet, PromptTemplate};
pub use stage::{StageError, StageRunner, RETRY_SEPARATOR};

use serde::{Deserialize, Serialize};

/// A model-backed transformation applied to one problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extractor,
    Solver,
    Tagger,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extractor, Stage::Solver, Stage::Tagger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extractor => "extractor",
            Stage::Solver => "solver",
            Stage::Tagger => "tagger",
        }
    }

    /// Label shown to users in progress messages.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Extractor => "识别题目",
            Stage::Solver => "解题",
            Stage::Tagger => "标注",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "extractor" | "ocr" | "extract" => Ok(Stage::Extractor),
            "solver" | "solve" | "solution" => Ok(Stage::Solver),
            "tagger" | "tag" | "tagging" | "retag" => Ok(Stage::Tagger),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}
