//! Execution of one stage for one problem.
//!
//! A stage call renders the primary template and calls the stage's model. Transient
//! failures are retried with the same prompt up to [`RetryConfig::max_retries`] times.
//! When the reply does not validate, the stricter retry template is rendered once with
//! `previous_error` set. A second invalid reply degrades (Tagger) or fails the stage.
//! Every model invocation is appended to the task's trace log.
//!
//! Retries stream into the same delta sink as the first call. Each retry is preceded by
//! [`RETRY_SEPARATOR`], so a partial reply from a failed attempt stays visibly apart from
//! the text that follows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::json::extract_object;
use super::prompt::{PromptContext, PromptSet};
use super::stages::StageSpec;
use super::Stage;
use crate::llm::{DeltaSink, ImageInput, LlmError, ModelPort, ModelReply, ModelRequest, ModelRouter, RetryConfig};
use crate::store::TaskStore;
use crate::task::{CallKind, TraceEvent};
use crate::util::now_string;

/// Written to the delta sink before every retried model call.
pub const RETRY_SEPARATOR: &str = "\n\n[retry]\n\n";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage} model call failed: {source}")]
    Model {
        stage: Stage,
        #[source]
        source: LlmError,
    },

    #[error("{stage} returned invalid output: {message}")]
    Schema { stage: Stage, message: String },

    #[error("{stage} input unavailable: {message}")]
    Input { stage: Stage, message: String },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            StageError::Model { stage, .. }
            | StageError::Schema { stage, .. }
            | StageError::Input { stage, .. } => *stage,
        }
    }
}

/// Inputs of one stage invocation.
pub struct StageCall<'a> {
    pub task_id: &'a str,
    pub problem_id: Option<&'a str>,
    pub context: &'a PromptContext,
    pub image: Option<&'a ImageInput>,
    pub on_delta: Option<DeltaSink>,
}

struct Invocation {
    reply: ModelReply,
    attempt: u32,
    kind: CallKind,
    latency: Duration,
}

pub struct StageRunner {
    router: Arc<ModelRouter>,
    prompts: Arc<PromptSet>,
    retry: RetryConfig,
    call_timeout: Duration,
    traces: Arc<dyn TaskStore>,
}

fn parse<S: StageSpec>(spec: &S, text: &str) -> Result<S::Output, String> {
    let object = extract_object(text).map_err(|e| e.to_string())?;
    spec.validate(object)
}

impl StageRunner {
    pub fn new(
        router: Arc<ModelRouter>,
        prompts: Arc<PromptSet>,
        retry: RetryConfig,
        call_timeout: Duration,
        traces: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            router,
            prompts,
            retry,
            call_timeout,
            traces,
        }
    }

    /// Run `spec` once, applying the transient and schema retry policies.
    pub async fn run<S: StageSpec>(&self, spec: &S, call: StageCall<'_>) -> Result<S::Output, StageError> {
        let stage = spec.stage();
        let port = self.router.for_stage(stage);
        let prompts = self.prompts.for_stage(stage);
        let mut attempt = 0;

        let request = prompts.primary.render(call.context);
        let first = self
            .invoke(port.as_ref(), stage, &request, &call, CallKind::Primary, &mut attempt)
            .await?;
        let parsed = parse(spec, &first.reply.text);
        self.record(&call, stage, &first, parsed.as_ref().err().cloned())
            .await;
        let previous_error = match parsed {
            Ok(output) => return Ok(output),
            Err(e) => e,
        };

        tracing::warn!(
            task_id = %call.task_id,
            stage = %stage,
            "Stage output rejected, retrying with strict prompt: {}",
            previous_error
        );
        let context = call.context.clone().with("previous_error", previous_error);
        let request = prompts.retry.render(&context);
        let second = self
            .invoke(port.as_ref(), stage, &request, &call, CallKind::SchemaRetry, &mut attempt)
            .await?;
        let parsed = parse(spec, &second.reply.text);
        self.record(&call, stage, &second, parsed.as_ref().err().cloned())
            .await;

        match parsed {
            Ok(output) => Ok(output),
            Err(message) => match spec.degraded() {
                Some(output) => {
                    tracing::warn!(
                        task_id = %call.task_id,
                        stage = %stage,
                        "Stage output still invalid, using degraded result: {}",
                        message
                    );
                    Ok(output)
                }
                None => Err(StageError::Schema { stage, message }),
            },
        }
    }

    /// One logical call: the first invocation plus transient retries.
    async fn invoke(
        &self,
        port: &dyn ModelPort,
        stage: Stage,
        request: &ModelRequest,
        call: &StageCall<'_>,
        first_kind: CallKind,
        attempt: &mut u32,
    ) -> Result<Invocation, StageError> {
        let mut retries = 0;
        let mut kind = first_kind;
        loop {
            *attempt += 1;
            if kind != CallKind::Primary {
                if let Some(sink) = &call.on_delta {
                    sink(RETRY_SEPARATOR);
                }
            }
            let started = Instant::now();
            let result = match call.image {
                Some(image) => {
                    tokio::time::timeout(
                        self.call_timeout,
                        port.structured_call_with_image(request, image, call.on_delta.clone()),
                    )
                    .await
                }
                None => {
                    tokio::time::timeout(
                        self.call_timeout,
                        port.structured_call(request, call.on_delta.clone()),
                    )
                    .await
                }
            }
            .unwrap_or_else(|_| Err(LlmError::timeout(self.call_timeout)));
            let latency = started.elapsed();

            let error = match result {
                Ok(reply) => {
                    return Ok(Invocation {
                        reply,
                        attempt: *attempt,
                        kind,
                        latency,
                    })
                }
                Err(error) => error,
            };

            self.append_trace(TraceEvent {
                ts: now_string(),
                task_id: call.task_id.to_string(),
                problem_id: call.problem_id.map(str::to_string),
                stage: stage.as_str().to_string(),
                model: port.model().to_string(),
                attempt: *attempt,
                kind,
                latency_ms: latency.as_millis() as u64,
                token_usage: None,
                error: Some(error.to_string()),
            })
            .await;

            if !(self.retry.should_retry(&error) && retries < self.retry.max_retries) {
                tracing::error!(
                    task_id = %call.task_id,
                    stage = %stage,
                    "Model call failed after {} retries: {}",
                    retries,
                    error
                );
                return Err(StageError::Model {
                    stage,
                    source: error,
                });
            }

            let delay = self.retry.delay_for(&error, retries);
            tracing::warn!(
                task_id = %call.task_id,
                stage = %stage,
                "Retry attempt {} failed with {}, retrying in {:?}: {}",
                retries + 1,
                error.kind,
                delay,
                error.message
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retries += 1;
            kind = CallKind::TransientRetry;
        }
    }

    async fn record(&self, call: &StageCall<'_>, stage: Stage, invocation: &Invocation, error: Option<String>) {
        self.append_trace(TraceEvent {
            ts: now_string(),
            task_id: call.task_id.to_string(),
            problem_id: call.problem_id.map(str::to_string),
            stage: stage.as_str().to_string(),
            model: invocation.reply.model.clone(),
            attempt: invocation.attempt,
            kind: invocation.kind,
            latency_ms: invocation.latency.as_millis() as u64,
            token_usage: invocation.reply.usage.clone(),
            error,
        })
        .await;
    }

    async fn append_trace(&self, event: TraceEvent) {
        if let Err(e) = self.traces.append_trace(&event.task_id, &event).await {
            tracing::warn!(task_id = %event.task_id, "Failed to append trace: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmErrorKind, StubClient, StubReply};
    use crate::pipeline::stages::{ExtractorSpec, RequiredTags, SolverSpec, TaggerSpec};
    use crate::store::InMemoryTaskStore;

    fn runner(stub: Arc<StubClient>, store: Arc<dyn TaskStore>, timeout: Duration) -> StageRunner {
        StageRunner::new(
            Arc::new(ModelRouter::uniform(stub)),
            Arc::new(PromptSet::builtin()),
            RetryConfig::immediate(2),
            timeout,
            store,
        )
    }

    fn call<'a>(context: &'a PromptContext) -> StageCall<'a> {
        StageCall {
            task_id: "t1",
            problem_id: Some("p1"),
            context,
            image: None,
            on_delta: None,
        }
    }

    #[tokio::test]
    async fn test_truncated_json_gets_strict_retry() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::text(r#"{"answer": "x=2", "explanation": "移项得"#),
            StubReply::text(r#"{"answer": "x=2", "explanation": "移项得 2x=4"}"#),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(Arc::clone(&stub), Arc::clone(&store), Duration::from_secs(5));
        let context = PromptContext::new().with("problem_text", "求解方程 2x+3=7");

        let solved = runner.run(&SolverSpec, call(&context)).await.unwrap();
        assert_eq!(solved.answer, "x=2");

        let calls = stub.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].user_prompt.contains("Previous error:"));
        assert!(calls[1].system_prompt.contains("ONE complete JSON"));

        let traces = store.read_traces("t1").await.unwrap();
        let kinds: Vec<CallKind> = traces.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![CallKind::Primary, CallKind::SchemaRetry]);
        assert!(traces[0].error.is_some());
        assert!(traces[1].error.is_none());
        assert_eq!(traces[1].attempt, 2);
        assert_eq!(traces[1].problem_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_transient_errors_retry_same_prompt() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::Transient("connection reset".into()),
            StubReply::text(r#"{"answer": "4", "explanation": "2+2"}"#),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(Arc::clone(&stub), Arc::clone(&store), Duration::from_secs(5));
        let context = PromptContext::new().with("problem_text", "2+2=?");

        runner.run(&SolverSpec, call(&context)).await.unwrap();

        let calls = stub.calls();
        assert_eq!(calls[0].user_prompt, calls[1].user_prompt);
        let kinds: Vec<CallKind> = store
            .read_traces("t1")
            .await
            .unwrap()
            .iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(kinds, vec![CallKind::Primary, CallKind::TransientRetry]);
    }

    #[tokio::test]
    async fn test_retried_call_is_separated_in_delta_stream() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::Interrupted(r#"{"answer": "4", "expl"#.into()),
            StubReply::text(r#"{"answer": "4", "explanation": "2+2"}"#),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(Arc::clone(&stub), store, Duration::from_secs(5));
        let context = PromptContext::new().with("problem_text", "2+2=?");
        let streamed = Arc::new(std::sync::Mutex::new(String::new()));
        let sink_text = Arc::clone(&streamed);
        let sink: DeltaSink = Arc::new(move |delta: &str| sink_text.lock().unwrap().push_str(delta));

        let solved = runner
            .run(
                &SolverSpec,
                StageCall {
                    on_delta: Some(sink),
                    ..call(&context)
                },
            )
            .await
            .unwrap();
        assert_eq!(solved.answer, "4");
        assert_eq!(
            *streamed.lock().unwrap(),
            format!(
                "{}{}{}",
                r#"{"answer": "4", "expl"#,
                RETRY_SEPARATOR,
                r#"{"answer": "4", "explanation": "2+2"}"#
            )
        );
    }

    #[tokio::test]
    async fn test_transient_errors_are_bounded() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::Transient("a".into()),
            StubReply::Transient("b".into()),
            StubReply::Transient("c".into()),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(Arc::clone(&stub), store, Duration::from_secs(5));
        let context = PromptContext::new();

        let err = runner.run(&SolverSpec, call(&context)).await.unwrap_err();
        assert!(matches!(err, StageError::Model { stage: Stage::Solver, .. }));
        assert_eq!(stub.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let stub = Arc::new(StubClient::scripted(vec![StubReply::Fatal("bad request".into())]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(Arc::clone(&stub), store, Duration::from_secs(5));
        let context = PromptContext::new();

        assert!(runner.run(&SolverSpec, call(&context)).await.is_err());
        assert_eq!(stub.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_tagger_degrades_after_second_failure() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::text("I think this is about equations."),
            StubReply::text("[\"still\", \"not an object\"]"),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(stub, store, Duration::from_secs(5));
        let context = PromptContext::new();
        let spec = TaggerSpec {
            problem_id: "p1".into(),
            required: RequiredTags {
                knowledge: vec!["分式方程".into()],
                error: Vec::new(),
            },
        };

        let tagging = runner.run(&spec, call(&context)).await.unwrap();
        assert_eq!(tagging.knowledge_points, vec!["分式方程"]);
        assert!(tagging.recommended_actions.is_empty());
    }

    #[tokio::test]
    async fn test_extractor_fails_after_second_invalid_reply() {
        let stub = Arc::new(StubClient::scripted(vec![
            StubReply::text("{}"),
            StubReply::text(r#"{"ocr_text": "blurred"}"#),
        ]));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = runner(stub, store, Duration::from_secs(5));
        let context = PromptContext::new();

        let err = runner.run(&ExtractorSpec, call(&context)).await.unwrap_err();
        match err {
            StageError::Schema { stage, message } => {
                assert_eq!(stage, Stage::Extractor);
                assert!(message.contains("problem_text"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_call_deadline_is_a_transient_timeout() {
        let stub = Arc::new(StubClient::new().with_latency(Duration::from_millis(300)));
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner = StageRunner::new(
            Arc::new(ModelRouter::uniform(stub)),
            Arc::new(PromptSet::builtin()),
            RetryConfig::immediate(0),
            Duration::from_millis(20),
            Arc::clone(&store),
        );
        let context = PromptContext::new();

        let err = runner.run(&SolverSpec, call(&context)).await.unwrap_err();
        match err {
            StageError::Model { source, .. } => assert_eq!(source.kind, LlmErrorKind::Timeout),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.read_traces("t1").await.unwrap().len(), 1);
    }
}
