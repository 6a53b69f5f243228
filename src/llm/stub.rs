//! Deterministic offline model client.
//!
//! Used when no provider is configured and throughout the test suite. Replies come from
//! a FIFO script first; once the script is empty a canned payload is chosen from the
//! output schema the prompt asks for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use super::error::LlmError;
use super::{DeltaSink, ImageInput, ModelPort, ModelReply, ModelRequest, TokenUsage};

const CHUNK_CHARS: usize = 12;

const EXTRACTOR_REPLY: &str = r#"{"problem_text":"求解方程 2x+3=7","latex_blocks":["2x+3=7"],"options":[],"ocr_text":"求解方程 2x+3=7"}"#;
const SOLVER_REPLY: &str = r#"{"answer":"x=2","explanation":"移项得 2x=4，两边同除以 2 得 x=2。","short_answer":"x=2"}"#;
const TAGGER_REPLY: &str = r#"{"knowledge_points":["一元一次方程"],"question_type":"解答题","skills":["移项"],"error_hypothesis":[],"recommended_actions":["复习等式的基本性质"]}"#;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum StubReply {
    Text(String),
    /// Fails with a transient network error
    Transient(String),
    /// Fails with a non-retryable client error
    Fatal(String),
    /// Streams the text, then fails with a transient network error
    Interrupted(String),
}

impl StubReply {
    pub fn text(text: impl Into<String>) -> Self {
        StubReply::Text(text.into())
    }
}

/// A call observed by the stub.
#[derive(Debug, Clone)]
pub struct StubCall {
    pub system_prompt: String,
    pub user_prompt: String,
    pub with_image: bool,
}

struct GateInner {
    entered: mpsc::UnboundedSender<usize>,
    release: Arc<Semaphore>,
}

/// Test handle that observes and releases calls held by a gated stub.
pub struct StubGate {
    entered: mpsc::UnboundedReceiver<usize>,
    release: Arc<Semaphore>,
}

impl StubGate {
    /// Wait until the next call is parked; returns its zero-based index.
    pub async fn entered(&mut self) -> Option<usize> {
        self.entered.recv().await
    }

    /// Let `n` parked or future calls proceed.
    pub fn release(&self, n: usize) {
        self.release.add_permits(n);
    }
}

pub struct StubClient {
    model: String,
    script: Mutex<VecDeque<StubReply>>,
    calls: Mutex<Vec<StubCall>>,
    latency: Duration,
    gate: Option<GateInner>,
}

impl Default for StubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl StubClient {
    pub fn new() -> Self {
        Self {
            model: "stub".to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            gate: None,
        }
    }

    /// Replies consumed in order before falling back to canned payloads.
    pub fn scripted(replies: Vec<StubReply>) -> Self {
        let stub = Self::new();
        if let Ok(mut script) = stub.script.lock() {
            script.extend(replies);
        }
        stub
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Park every call until the returned gate releases it.
    pub fn gated(mut self) -> (Self, StubGate) {
        let (tx, rx) = mpsc::unbounded_channel();
        let release = Arc::new(Semaphore::new(0));
        self.gate = Some(GateInner {
            entered: tx,
            release: Arc::clone(&release),
        });
        (
            self,
            StubGate {
                entered: rx,
                release,
            },
        )
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn canned(request: &ModelRequest) -> &'static str {
        let prompt = format!("{}\n{}", request.system_prompt, request.user_prompt);
        if prompt.contains("knowledge_points") {
            TAGGER_REPLY
        } else if prompt.contains("\"answer\"") {
            SOLVER_REPLY
        } else {
            EXTRACTOR_REPLY
        }
    }

    async fn respond(
        &self,
        request: &ModelRequest,
        with_image: bool,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        let index = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| LlmError::network_error("stub state poisoned".to_string()))?;
            calls.push(StubCall {
                system_prompt: request.system_prompt.clone(),
                user_prompt: request.user_prompt.clone(),
                with_image,
            });
            calls.len() - 1
        };

        if let Some(gate) = &self.gate {
            let _ = gate.entered.send(index);
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let (text, interrupted) = match scripted {
            Some(StubReply::Text(text)) => (text, false),
            Some(StubReply::Interrupted(text)) => (text, true),
            Some(StubReply::Transient(message)) => return Err(LlmError::network_error(message)),
            Some(StubReply::Fatal(message)) => return Err(LlmError::client_error(400, message)),
            None => (Self::canned(request).to_string(), false),
        };

        if let Some(sink) = on_delta {
            let chars: Vec<char> = text.chars().collect();
            for chunk in chars.chunks(CHUNK_CHARS) {
                sink(&chunk.iter().collect::<String>());
            }
        }
        if interrupted {
            return Err(LlmError::network_error("stream interrupted".to_string()));
        }

        let prompt_chars = request.system_prompt.chars().count() + request.user_prompt.chars().count();
        Ok(ModelReply {
            usage: Some(TokenUsage::new(
                (prompt_chars / 4) as u64,
                (text.chars().count() / 4) as u64,
            )),
            text,
            model: self.model.clone(),
        })
    }
}

#[async_trait]
impl ModelPort for StubClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn structured_call(
        &self,
        request: &ModelRequest,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        self.respond(request, false, on_delta).await
    }

    async fn structured_call_with_image(
        &self,
        request: &ModelRequest,
        _image: &ImageInput,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        self.respond(request, true, on_delta).await
    }
}
