//! OpenAI-compatible chat completions client.
//!
//! Performs exactly one attempt per call; transient retries belong to the stage runner
//! so they can be traced per attempt. When a delta sink is supplied and streaming is
//! enabled, tokens are read from the SSE response and forwarded as they arrive.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use super::error::LlmError;
use super::router::ProviderConfig;
use super::{
    ChatMessage, ChatOptions, DeltaSink, ImageInput, ModelPort, ModelReply, ModelRequest,
    TokenUsage,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    defaults: ChatOptions,
    stream: bool,
}

impl OpenAiCompatibleClient {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| LlmError::network_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            defaults: ChatOptions {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
            stream: config.stream,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Parse Retry-After header if present.
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn classify_send_error(e: reqwest::Error) -> LlmError {
        if e.is_timeout() {
            LlmError::network_error(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            LlmError::network_error(format!("Connection failed: {}", e))
        } else {
            LlmError::network_error(format!("Request failed: {}", e))
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn body(&self, messages: Vec<ChatMessage>, options: &ChatOptions, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages,
            temperature: options.temperature.or(self.defaults.temperature),
            max_tokens: options.max_tokens.or(self.defaults.max_tokens),
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_string(),
            }),
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    async fn dispatch(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        match on_delta {
            Some(sink) if self.stream => self.complete_streaming(messages, options, sink).await,
            _ => self.complete(messages, options).await,
        }
    }

    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> Result<ModelReply, LlmError> {
        let body = self.body(messages, options, false);
        let response = self
            .authorized(self.client.post(self.chat_url()))
            .json(&body)
            .send()
            .await
            .map_err(Self::classify_send_error)?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text, retry_after));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, text))
        })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::parse_error("No choices in response".to_string()))?;

        Ok(ModelReply {
            text: content,
            usage: parsed
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    async fn complete_streaming(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        on_delta: DeltaSink,
    ) -> Result<ModelReply, LlmError> {
        let body = self.body(messages, options, true);
        let builder = self.authorized(self.client.post(self.chat_url())).json(&body);
        let mut source = EventSource::new(builder)
            .map_err(|e| LlmError::network_error(format!("Cannot open stream: {}", e)))?;
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let mut text = String::new();
        let mut usage = None;
        let mut model = None;

        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    let data = message.data.trim();
                    if data == "[DONE]" {
                        break;
                    }
                    let chunk: StreamChunk = match serde_json::from_str(data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            source.close();
                            return Err(LlmError::parse_error(format!(
                                "Bad stream chunk: {}, data: {}",
                                e, data
                            )));
                        }
                    };
                    if chunk.model.is_some() {
                        model = chunk.model;
                    }
                    if let Some(u) = chunk.usage {
                        usage = Some(TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                    }
                    for choice in chunk.choices {
                        if let Some(piece) = choice.delta.content.filter(|p| !p.is_empty()) {
                            on_delta(&piece);
                            text.push_str(&piece);
                        }
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    source.close();
                    let retry_after = Self::parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    return Err(LlmError::from_status(status.as_u16(), body, retry_after));
                }
                Err(e) => {
                    source.close();
                    return Err(LlmError::network_error(format!("Stream failed: {}", e)));
                }
            }
        }
        source.close();

        Ok(ModelReply {
            text,
            usage,
            model: model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[async_trait]
impl ModelPort for OpenAiCompatibleClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn structured_call(
        &self,
        request: &ModelRequest,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        tracing::debug!(model = %self.model, "Sending structured call");
        self.dispatch(request.messages(), &request.options, on_delta)
            .await
    }

    async fn structured_call_with_image(
        &self,
        request: &ModelRequest,
        image: &ImageInput,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError> {
        tracing::debug!(model = %self.model, "Sending structured call with image");
        self.dispatch(request.messages_with_image(image), &request.options, on_delta)
            .await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageBody>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsageBody>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ProviderKind;

    fn config() -> ProviderConfig {
        ProviderConfig {
            kind: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            base_url: Some("http://localhost:9999/v1/".to_string()),
            api_key: Some("sk-test".to_string()),
            temperature: Some(0.2),
            max_tokens: None,
            stream: true,
        }
    }

    #[test]
    fn test_chat_url_trims_trailing_slash() {
        let client = OpenAiCompatibleClient::new(&config(), Duration::from_secs(5)).unwrap();
        assert_eq!(client.chat_url(), "http://localhost:9999/v1/chat/completions");
    }

    #[test]
    fn test_request_body_carries_defaults_and_stream_flags() {
        let client = OpenAiCompatibleClient::new(&config(), Duration::from_secs(5)).unwrap();
        let request = ModelRequest::new("sys", "user");
        let body = serde_json::to_value(client.body(request.messages(), &request.options, true))
            .unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["response_format"]["type"], "json_object");

        let plain = serde_json::to_value(client.body(request.messages(), &request.options, false))
            .unwrap();
        assert!(plain.get("stream").is_none());
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"id":"c","choices":[{"index":0,"delta":{"content":"{\"ans"}}],"model":"m"}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("{\"ans"));

        let tail: StreamChunk =
            serde_json::from_str(r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#)
                .unwrap();
        assert_eq!(tail.usage.unwrap().completion_tokens, 4);
    }
}
