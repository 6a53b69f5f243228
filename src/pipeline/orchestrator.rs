//! Sequencing of stages over a task's problems.
//!
//! A run first extracts every region that still lacks a problem, in region order, then
//! walks the problems in order and runs the Solver and the Tagger where their output is
//! missing. The cancellation token is checked before every stage and before moving on to
//! the next problem.
//!
//! Writes go through [`TaskLedger`] and are dropped when the problem was deleted or
//! edited while its stage was running, so concurrent human edits always win.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::prompt::PromptContext;
use super::stage::{StageCall, StageError, StageRunner};
use super::stages::{ExtractedProblem, ExtractorSpec, RequiredTags, SolverSpec, SolvedProblem, TaggerSpec};
use super::Stage;
use crate::llm::{DeltaSink, ImageInput};
use crate::store::{AssetStore, StoreError, TaskLedger};
use crate::stream::StreamPublisher;
use crate::tags::{TagDimension, TagStore};
use crate::task::{CropRegion, Problem, Solution, TaggingResult, Task, TaskError, TaskStatus};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("pipeline run crashed: {0}")]
    Crashed(String),
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Existing tags offered to the Tagger per dimension
    pub tag_candidate_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tag_candidate_limit: 50,
        }
    }
}

/// Which outputs a run computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Only what is missing
    Resume,
    /// Everything again, except problems a human edited
    Recompute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// One background run of a task.
pub struct RunContext {
    pub task_id: String,
    pub mode: RunMode,
    pub cancel: CancellationToken,
    pub publisher: Option<StreamPublisher>,
}

impl RunContext {
    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn delta_sink(&self) -> Option<DeltaSink> {
        self.publisher.as_ref().map(StreamPublisher::delta_sink)
    }
}

fn or_none(values: &[String]) -> String {
    if values.is_empty() {
        "(none)".to_string()
    } else {
        values.join(", ")
    }
}

fn apply_extraction(problem: &mut Problem, extracted: ExtractedProblem) {
    problem.problem_text = extracted.problem_text;
    problem.latex_blocks = extracted.latex_blocks;
    problem.options = extracted.options;
    problem.ocr_text = extracted.ocr_text;
    if extracted.question_type.is_some() {
        problem.question_type = extracted.question_type;
    }
}

fn region_order(task: &Task) -> impl Fn(&Problem) -> usize {
    let ids: Vec<String> = task.effective_regions().into_iter().map(|r| r.id).collect();
    move |p: &Problem| {
        p.region_id
            .as_ref()
            .and_then(|r| ids.iter().position(|id| id == r))
            .unwrap_or(usize::MAX)
    }
}

pub struct PipelineOrchestrator {
    runner: StageRunner,
    ledger: TaskLedger,
    tags: Arc<TagStore>,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(runner: StageRunner, ledger: TaskLedger, tags: Arc<TagStore>, settings: PipelineSettings) -> Self {
        Self {
            runner,
            ledger,
            tags,
            settings,
        }
    }

    /// Drive a task until every problem has all outputs or the run is cancelled.
    pub async fn run(&self, ctx: &RunContext) -> Result<RunOutcome, PipelineError> {
        if ctx.cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        let task = self.ledger.get(&ctx.task_id).await?;

        let regions: Vec<CropRegion> = task
            .effective_regions()
            .into_iter()
            .filter(|r| {
                match task
                    .problems
                    .iter()
                    .find(|p| p.region_id.as_deref() == Some(r.id.as_str()))
                {
                    None => true,
                    Some(p) => ctx.mode == RunMode::Recompute && !p.edited,
                }
            })
            .collect();

        if !regions.is_empty() {
            let image = Self::load_image(&task).await?;
            let total = regions.len();
            for (idx, region) in regions.iter().enumerate() {
                if ctx.cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                self.announce(ctx, Stage::Extractor, idx, total).await?;
                let current = self.ledger.get(&ctx.task_id).await?;
                let existing = current
                    .problems
                    .iter()
                    .find(|p| p.region_id.as_deref() == Some(region.id.as_str()))
                    .cloned();
                let extracted = self
                    .extract(&current, region, &image, ctx.delta_sink())
                    .await?;
                self.store_extraction(&ctx.task_id, region, existing, extracted, false)
                    .await?;
            }
        }

        let problem_ids: Vec<String> = self
            .ledger
            .get(&ctx.task_id)
            .await?
            .problems
            .iter()
            .map(|p| p.problem_id.clone())
            .collect();
        let total = problem_ids.len();

        for (idx, problem_id) in problem_ids.iter().enumerate() {
            if ctx.cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let task = self.ledger.get(&ctx.task_id).await?;
            let Some(problem) = task.problem(problem_id).cloned() else {
                continue;
            };
            if ctx.mode == RunMode::Recompute || task.solution(problem_id).is_none() {
                if ctx.cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                self.announce(ctx, Stage::Solver, idx, total).await?;
                let solved = self.solve(&task, &problem, ctx.delta_sink()).await?;
                self.store_solution(&ctx.task_id, &problem, solved).await?;
            }

            let task = self.ledger.get(&ctx.task_id).await?;
            let Some(problem) = task.problem(problem_id).cloned() else {
                continue;
            };
            if ctx.mode == RunMode::Recompute || task.tagging(problem_id).is_none() {
                if ctx.cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                self.announce(ctx, Stage::Tagger, idx, total).await?;
                let tagging = self.tag(&task, &problem, ctx.delta_sink()).await?;
                self.store_tagging(&ctx.task_id, &problem, tagging).await?;
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Run one stage for one problem and store only that output.
    pub async fn rerun(&self, task_id: &str, problem_id: &str, stage: Stage) -> Result<Task, PipelineError> {
        let task = self.ledger.get(task_id).await?;
        let problem = task
            .problem(problem_id)
            .cloned()
            .ok_or_else(|| TaskError::ProblemNotFound(problem_id.to_string()))?;
        tracing::info!(task_id = %task_id, problem_id = %problem_id, stage = %stage, "Rerunning stage");

        match stage {
            Stage::Extractor => {
                let region = problem
                    .region_id
                    .as_ref()
                    .and_then(|id| task.effective_regions().into_iter().find(|r| &r.id == id))
                    .unwrap_or_else(|| CropRegion {
                        id: problem.region_id.clone().unwrap_or_else(|| "full".to_string()),
                        bbox: problem.crop_bbox,
                        label: None,
                    });
                let image = Self::load_image(&task).await?;
                let extracted = self.extract(&task, &region, &image, None).await?;
                self.store_extraction(task_id, &region, Some(problem), extracted, true)
                    .await?;
            }
            Stage::Solver => {
                let solved = self.solve(&task, &problem, None).await?;
                self.store_solution(task_id, &problem, solved).await?;
            }
            Stage::Tagger => {
                let tagging = self.tag(&task, &problem, None).await?;
                self.store_tagging(task_id, &problem, tagging).await?;
            }
        }
        Ok(self.ledger.get(task_id).await?)
    }

    async fn load_image(task: &Task) -> Result<ImageInput, PipelineError> {
        AssetStore::load(&task.asset).await.map_err(|message| {
            PipelineError::Stage(StageError::Input {
                stage: Stage::Extractor,
                message,
            })
        })
    }

    async fn announce(&self, ctx: &RunContext, stage: Stage, idx: usize, total: usize) -> Result<(), PipelineError> {
        let message = format!("{} {}/{}", stage.label(), idx + 1, total);
        tracing::info!(task_id = %ctx.task_id, stage = %stage, "{}", message);
        self.ledger
            .update::<_, PipelineError, _>(&ctx.task_id, |task| {
                task.set_stage(stage.as_str(), message.clone());
                Ok(())
            })
            .await?;
        if let Some(publisher) = &ctx.publisher {
            publisher.progress(TaskStatus::Processing, Some(stage.as_str().to_string()), Some(message));
        }
        Ok(())
    }

    async fn extract(
        &self,
        task: &Task,
        region: &CropRegion,
        image: &ImageInput,
        on_delta: Option<DeltaSink>,
    ) -> Result<ExtractedProblem, PipelineError> {
        let bbox = region
            .bbox
            .map(|b| format!("[{:.3}, {:.3}, {:.3}, {:.3}]", b[0], b[1], b[2], b[3]))
            .unwrap_or_default();
        let context = PromptContext::new()
            .with("subject", task.hints.subject.clone())
            .with("grade", task.hints.grade.clone().unwrap_or_default())
            .with("question_no", task.hints.question_no.clone().unwrap_or_default())
            .with("notes", task.hints.notes.clone().unwrap_or_default())
            .with("region_label", region.label.clone().unwrap_or_else(|| region.id.clone()))
            .with("bbox", bbox);
        let output = self
            .runner
            .run(
                &ExtractorSpec,
                StageCall {
                    task_id: &task.id,
                    problem_id: None,
                    context: &context,
                    image: Some(image),
                    on_delta,
                },
            )
            .await?;
        Ok(output)
    }

    async fn solve(
        &self,
        task: &Task,
        problem: &Problem,
        on_delta: Option<DeltaSink>,
    ) -> Result<SolvedProblem, PipelineError> {
        let context = PromptContext::new()
            .with("subject", task.hints.subject.clone())
            .with("grade", task.hints.grade.clone().unwrap_or_default())
            .with("notes", task.hints.notes.clone().unwrap_or_default())
            .with("problem_text", problem.problem_text.clone())
            .with("options", problem.options_text())
            .with("latex", problem.latex_blocks.join("\n"));
        let output = self
            .runner
            .run(
                &SolverSpec,
                StageCall {
                    task_id: &task.id,
                    problem_id: Some(&problem.problem_id),
                    context: &context,
                    image: None,
                    on_delta,
                },
            )
            .await?;
        Ok(output)
    }

    async fn tag(
        &self,
        task: &Task,
        problem: &Problem,
        on_delta: Option<DeltaSink>,
    ) -> Result<TaggingResult, PipelineError> {
        let limit = self.settings.tag_candidate_limit;
        let answer = task
            .solution(&problem.problem_id)
            .map(|s| s.answer.clone())
            .unwrap_or_default();
        let context = PromptContext::new()
            .with("subject", task.hints.subject.clone())
            .with("problem_text", problem.problem_text.clone())
            .with("options", problem.options_text())
            .with("answer", answer)
            .with("knowledge_candidates", or_none(&self.tags.top(TagDimension::Knowledge, limit).await))
            .with("error_candidates", or_none(&self.tags.top(TagDimension::Error, limit).await))
            .with("meta_candidates", or_none(&self.tags.top(TagDimension::Meta, limit).await))
            .with("manual_knowledge_tags", or_none(&problem.knowledge_tags))
            .with("manual_error_tags", or_none(&problem.error_tags))
            .with("user_tags", or_none(&problem.user_tags));
        let spec = TaggerSpec {
            problem_id: problem.problem_id.clone(),
            required: RequiredTags {
                knowledge: problem.knowledge_tags.clone(),
                error: problem.error_tags.clone(),
            },
        };
        let output = self
            .runner
            .run(
                &spec,
                StageCall {
                    task_id: &task.id,
                    problem_id: Some(&problem.problem_id),
                    context: &context,
                    image: None,
                    on_delta,
                },
            )
            .await?;
        Ok(output)
    }

    /// Store an extraction. With `force` an edited problem is overwritten and unmarked.
    async fn store_extraction(
        &self,
        task_id: &str,
        region: &CropRegion,
        existing: Option<Problem>,
        extracted: ExtractedProblem,
        force: bool,
    ) -> Result<(), PipelineError> {
        let (_, stored) = self
            .ledger
            .update::<_, PipelineError, _>(task_id, |task| {
                if let Some(before) = existing {
                    let Ok(problem) = task.problem_mut(&before.problem_id) else {
                        return Ok(false);
                    };
                    if !force && *problem != before {
                        return Ok(false);
                    }
                    apply_extraction(problem, extracted);
                    problem.edited = false;
                    return Ok(true);
                }

                if task
                    .problems
                    .iter()
                    .any(|p| p.region_id.as_deref() == Some(region.id.as_str()))
                {
                    return Ok(false);
                }
                let single = task.effective_regions().len() == 1;
                let mut problem = Problem::new(region.id.clone(), String::new());
                apply_extraction(&mut problem, extracted);
                problem.crop_bbox = region.bbox;
                problem.source = task.hints.source.clone();
                if single {
                    problem.question_no = task.hints.question_no.clone();
                }
                problem.knowledge_tags = task.hints.knowledge_tags.clone();
                problem.error_tags = task.hints.error_tags.clone();
                problem.user_tags = task.hints.user_tags.clone();
                task.problems.push(problem);
                let order = region_order(task);
                task.problems.sort_by_key(|p| order(p));
                Ok(true)
            })
            .await?;
        if !stored {
            tracing::info!(task_id = %task_id, region = %region.id, "Problem changed during extraction, result dropped");
        }
        Ok(())
    }

    async fn store_solution(&self, task_id: &str, before: &Problem, solved: SolvedProblem) -> Result<(), PipelineError> {
        let solution = Solution {
            problem_id: before.problem_id.clone(),
            answer: solved.answer,
            explanation: solved.explanation,
            short_answer: solved.short_answer,
        };
        let (_, stored) = self
            .ledger
            .update::<_, PipelineError, _>(task_id, |task| {
                if task.problem(&before.problem_id) != Some(before) {
                    return Ok(false);
                }
                task.put_solution(solution)?;
                Ok(true)
            })
            .await?;
        if !stored {
            tracing::info!(task_id = %task_id, problem_id = %before.problem_id, "Problem changed while solving, result dropped");
        }
        Ok(())
    }

    async fn store_tagging(&self, task_id: &str, before: &Problem, tagging: TaggingResult) -> Result<(), PipelineError> {
        let (_, stored) = self
            .ledger
            .update::<_, PipelineError, _>(task_id, |task| {
                if task.problem(&before.problem_id) != Some(before) {
                    return Ok(false);
                }
                task.put_tagging(tagging.clone())?;
                Ok(true)
            })
            .await?;
        if !stored {
            tracing::info!(task_id = %task_id, problem_id = %before.problem_id, "Problem changed while tagging, result dropped");
            return Ok(());
        }

        let recorded = [
            (TagDimension::Knowledge, tagging.knowledge_points.clone()),
            (TagDimension::Error, tagging.error_hypothesis.clone()),
            (TagDimension::Meta, tagging.question_type.clone().into_iter().collect()),
            (TagDimension::Custom, before.user_tags.clone()),
        ];
        for (dimension, values) in recorded {
            if let Err(e) = self.tags.ensure(dimension, &values).await {
                tracing::warn!(task_id = %task_id, "Failed to record {} tags: {}", dimension.as_str(), e);
            }
        }
        Ok(())
    }
}
