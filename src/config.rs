//! Configuration management for oopsnote.
//!
//! Configuration is read from environment variables:
//! - `HOST` / `PORT` - Server bind address. Defaults to `127.0.0.1:8000`.
//! - `OOPSNOTE_DATA_DIR` - Root for tasks, traces, stream logs, assets and tags. Defaults to `./data`.
//! - `OOPSNOTE_STORE` - `memory`, `file` or `sqlite`. Defaults to `file`.
//! - `PROMPT_DIR` - Optional. Directory of prompt templates overriding the built-in ones.
//! - `MODEL_PROVIDER` - `openai` or `stub`. Defaults to `openai` when `OPENAI_API_KEY` is set.
//! - `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL`, `OPENAI_TEMPERATURE`,
//!   `OPENAI_MAX_TOKENS`, `OPENAI_STREAM` - Default provider settings.
//! - `AGENT_{EXTRACTOR,SOLVER,TAGGER}_{PROVIDER,MODEL,BASE_URL,API_KEY,TEMPERATURE}` -
//!   Per-stage overrides. Unset fields inherit the default provider.
//! - `AGENT_CONFIG_PATH` - Optional YAML file with per-stage overrides keyed by stage name.
//!   Environment overrides win over the file.
//! - `STAGE_TRANSIENT_RETRIES` - Transient retries per model call. Defaults to `2`.
//! - `STAGE_CALL_TIMEOUT_SECS` - Deadline of one model call. Defaults to `180`.
//! - `TAG_CANDIDATE_LIMIT` - Known tags offered to the tagger per dimension. Defaults to `50`.
//! - `STREAM_FLUSH_MS` - Delta coalescing interval. Defaults to `50`.
//! - `STREAM_REPLAY_MAX_CHARS` - Default cap for stream replay. Defaults to `200000`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::llm::{ProviderConfig, ProviderKind, ProviderOverride, RetryConfig};
use crate::pipeline::{PipelineSettings, Stage};
use crate::store::TaskStoreType;
use crate::stream::StreamSettings;
use crate::util::parse_flag;

const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Failed to read agent config {path}: {message}")]
    AgentFile { path: PathBuf, message: String },
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// Root directory for every persisted artifact
    pub data_dir: PathBuf,

    pub store_type: TaskStoreType,

    /// Prompt template override directory
    pub prompt_dir: Option<PathBuf>,

    /// Provider used by stages without an override
    pub provider: ProviderConfig,

    /// Fully merged provider per stage, only for stages that differ from `provider`
    pub stage_providers: HashMap<Stage, ProviderConfig>,

    pub retry: RetryConfig,
    pub call_timeout: Duration,
    pub pipeline: PipelineSettings,
    pub stream: StreamSettings,
    pub replay_max_chars: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for malformed numbers or unknown names, and
    /// `ConfigError::MissingEnvVar` when the OpenAI provider is selected without a key.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(crate::util::env_var_opt)
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&lookup, "PORT", 8000u16)?;

        let data_dir = lookup("OOPSNOTE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));

        let store_type = match lookup("OOPSNOTE_STORE") {
            Some(value) => TaskStoreType::parse(&value)
                .ok_or_else(|| ConfigError::InvalidValue("OOPSNOTE_STORE".to_string(), value))?,
            None => TaskStoreType::default(),
        };

        let prompt_dir = lookup("PROMPT_DIR").map(PathBuf::from);

        let provider = default_provider(&lookup)?;

        let mut stage_overrides = match lookup("AGENT_CONFIG_PATH") {
            Some(path) => load_agent_file(Path::new(&path))?,
            None => HashMap::new(),
        };
        for stage in Stage::ALL {
            let from_env = stage_override(&lookup, stage)?;
            if from_env.is_empty() {
                continue;
            }
            let entry = stage_overrides.entry(stage).or_default();
            layer_override(entry, from_env);
        }

        let mut stage_providers = HashMap::new();
        for (stage, over) in stage_overrides {
            let merged = provider.merged(&over);
            check_provider(&merged, &format!("AGENT_{}_API_KEY", stage.as_str().to_uppercase()))?;
            if merged != provider {
                stage_providers.insert(stage, merged);
            }
        }

        let retry = RetryConfig {
            max_retries: parse_or(&lookup, "STAGE_TRANSIENT_RETRIES", 2u32)?,
            ..RetryConfig::default()
        };
        let call_timeout = Duration::from_secs(parse_or(&lookup, "STAGE_CALL_TIMEOUT_SECS", 180u64)?);

        let pipeline = PipelineSettings {
            tag_candidate_limit: parse_or(&lookup, "TAG_CANDIDATE_LIMIT", 50usize)?,
        };

        let stream = StreamSettings {
            flush_interval: Duration::from_millis(parse_or(&lookup, "STREAM_FLUSH_MS", 50u64)?),
            ..StreamSettings::default()
        };
        let replay_max_chars = parse_or(&lookup, "STREAM_REPLAY_MAX_CHARS", 200_000usize)?;

        Ok(Self {
            host,
            port,
            data_dir,
            store_type,
            prompt_dir,
            provider,
            stage_providers,
            retry,
            call_timeout,
            pipeline,
            stream,
            replay_max_chars,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.data_dir.join("assets")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.data_dir.join("tags.json")
    }
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn parse_opt<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|value| {
            value
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string()))
        })
        .transpose()
}

fn parse_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).map_or(default, |value| parse_flag(&value))
}

fn default_provider<F>(lookup: &F) -> Result<ProviderConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = lookup("OPENAI_API_KEY");
    let kind = match lookup("MODEL_PROVIDER") {
        Some(value) => ProviderKind::from_str(&value)
            .map_err(|e| ConfigError::InvalidValue("MODEL_PROVIDER".to_string(), e))?,
        None if api_key.is_some() => ProviderKind::OpenAi,
        None => ProviderKind::Stub,
    };

    let config = match kind {
        ProviderKind::Stub => ProviderConfig::stub(),
        ProviderKind::OpenAi => ProviderConfig {
            kind,
            model: lookup("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            base_url: lookup("OPENAI_BASE_URL"),
            api_key,
            temperature: parse_opt(lookup, "OPENAI_TEMPERATURE")?,
            max_tokens: parse_opt(lookup, "OPENAI_MAX_TOKENS")?,
            stream: parse_bool(lookup, "OPENAI_STREAM", true),
        },
    };
    check_provider(&config, "OPENAI_API_KEY")?;
    Ok(config)
}

fn stage_override<F>(lookup: &F, stage: Stage) -> Result<ProviderOverride, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("AGENT_{}", stage.as_str().to_uppercase());
    let provider_var = format!("{}_PROVIDER", prefix);
    let provider = lookup(&provider_var)
        .map(|value| ProviderKind::from_str(&value).map_err(|e| ConfigError::InvalidValue(provider_var.clone(), e)))
        .transpose()?;

    Ok(ProviderOverride {
        provider,
        model: lookup(&format!("{}_MODEL", prefix)),
        base_url: lookup(&format!("{}_BASE_URL", prefix)),
        api_key: lookup(&format!("{}_API_KEY", prefix)),
        temperature: parse_opt(lookup, &format!("{}_TEMPERATURE", prefix))?,
        max_tokens: None,
        stream: None,
    })
}

/// Fields set in `top` replace the ones in `base`.
fn layer_override(base: &mut ProviderOverride, top: ProviderOverride) {
    if top.provider.is_some() {
        base.provider = top.provider;
    }
    if top.model.is_some() {
        base.model = top.model;
    }
    if top.base_url.is_some() {
        base.base_url = top.base_url;
    }
    if top.api_key.is_some() {
        base.api_key = top.api_key;
    }
    if top.temperature.is_some() {
        base.temperature = top.temperature;
    }
}

fn check_provider(config: &ProviderConfig, key_var: &str) -> Result<(), ConfigError> {
    if config.kind == ProviderKind::OpenAi && config.api_key.is_none() && config.base_url.is_none() {
        return Err(ConfigError::MissingEnvVar(key_var.to_string()));
    }
    Ok(())
}

fn load_agent_file(path: &Path) -> Result<HashMap<Stage, ProviderOverride>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::AgentFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_yaml::from_str(&text).map_err(|e| ConfigError::AgentFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
