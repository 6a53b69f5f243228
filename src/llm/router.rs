//! Per-stage model selection.
//!
//! Each stage (extractor, solver, tagger) may talk to a different provider. The router
//! is built once at startup from configuration and hands out the port for a stage at
//! the start of every stage invocation.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::LlmError;
use super::openai::OpenAiCompatibleClient;
use super::stub::StubClient;
use super::ModelPort;
use crate::pipeline::Stage;

/// Which concrete client backs a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Stub,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "openai-compatible" | "oai" => Ok(ProviderKind::OpenAi),
            "stub" | "mock" => Ok(ProviderKind::Stub),
            "gemini" | "google" => Err(
                "gemini provider is not supported; use provider=openai with an OpenAI-compatible gateway (base_url)"
                    .to_string(),
            ),
            other => Err(format!("unknown model provider: {}", other)),
        }
    }
}

/// Fully resolved settings for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

impl ProviderConfig {
    pub fn stub() -> Self {
        Self {
            kind: ProviderKind::Stub,
            model: "stub".to_string(),
            base_url: None,
            api_key: None,
            temperature: None,
            max_tokens: None,
            stream: true,
        }
    }

    /// Layer a partial override on top of these settings.
    pub fn merged(&self, over: &ProviderOverride) -> Self {
        let mut out = self.clone();
        if let Some(kind) = over.provider {
            out.kind = kind;
        }
        if let Some(model) = &over.model {
            out.model = model.clone();
        }
        if over.base_url.is_some() {
            out.base_url = over.base_url.clone();
        }
        if over.api_key.is_some() {
            out.api_key = over.api_key.clone();
        }
        if over.temperature.is_some() {
            out.temperature = over.temperature;
        }
        if over.max_tokens.is_some() {
            out.max_tokens = over.max_tokens;
        }
        if let Some(stream) = over.stream {
            out.stream = stream;
        }
        out
    }

    fn build(&self, timeout: Duration) -> Result<Arc<dyn ModelPort>, LlmError> {
        Ok(match self.kind {
            ProviderKind::OpenAi => Arc::new(OpenAiCompatibleClient::new(self, timeout)?),
            ProviderKind::Stub => Arc::new(StubClient::new().with_model(self.model.clone())),
        })
    }
}

/// Partial provider settings from env vars or the agent YAML file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderOverride {
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ProviderOverride {
    pub fn is_empty(&self) -> bool {
        *self == ProviderOverride::default()
    }
}

/// Maps each stage to the port that serves it.
pub struct ModelRouter {
    default: Arc<dyn ModelPort>,
    stages: HashMap<Stage, Arc<dyn ModelPort>>,
}

impl ModelRouter {
    /// Every stage uses the same port.
    pub fn uniform(port: Arc<dyn ModelPort>) -> Self {
        Self {
            default: port,
            stages: HashMap::new(),
        }
    }

    pub fn with_stage(mut self, stage: Stage, port: Arc<dyn ModelPort>) -> Self {
        self.stages.insert(stage, port);
        self
    }

    /// Build clients for the default provider and any per-stage override.
    pub fn from_configs(
        default: &ProviderConfig,
        stages: &HashMap<Stage, ProviderConfig>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let mut router = Self::uniform(default.build(timeout)?);
        for (stage, config) in stages {
            if config == default {
                continue;
            }
            tracing::info!(
                stage = %stage,
                provider = ?config.kind,
                model = %config.model,
                "Stage uses dedicated model provider"
            );
            router = router.with_stage(*stage, config.build(timeout)?);
        }
        Ok(router)
    }

    pub fn for_stage(&self, stage: Stage) -> Arc<dyn ModelPort> {
        self.stages
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}
