//! Model client module.
//!
//! The pipeline only sees [`ModelPort`]: a structured chat call, optionally with an
//! attached image, returning raw text plus the provider's usage metadata. Concrete
//! clients are an OpenAI-compatible HTTP client and a deterministic stub. Which client
//! a stage talks to is decided by [`ModelRouter`] from configuration.

mod error;
mod openai;
mod router;
mod stub;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openai::OpenAiCompatibleClient;
pub use router::{ModelRouter, ProviderConfig, ProviderKind, ProviderOverride};
pub use stub::{StubCall, StubClient, StubGate, StubReply};

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Role in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Content part for multimodal messages (text or image).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL wrapper for vision content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    /// Optional detail level: "auto", "low", or "high"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: Some("high".to_string()),
            },
        }
    }
}

/// Message content - either simple text or multimodal (text + images).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// A message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a multimodal message with text and image.
    pub fn with_image(role: Role, text: impl Into<String>, image_url: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: MessageContent::Parts(vec![
                ContentPart::text(text),
                ContentPart::image_url(image_url),
            ]),
        }
    }
}

/// Token usage information (if provided by the upstream provider).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage object ensuring `total_tokens` is consistent.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// Optional sampling parameters.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

/// A rendered prompt ready for a model call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: ChatOptions,
}

impl ModelRequest {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            options: ChatOptions::default(),
        }
    }

    fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::new(Role::System, self.system_prompt.clone()));
        }
        messages.push(ChatMessage::new(Role::User, self.user_prompt.clone()));
        messages
    }

    fn messages_with_image(&self, image: &ImageInput) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::new(Role::System, self.system_prompt.clone()));
        }
        messages.push(ChatMessage::with_image(
            Role::User,
            self.user_prompt.clone(),
            image.to_url(),
        ));
        messages
    }
}

/// Image attached to a model call.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Raw bytes, sent inline as a data URL
    Bytes { data: Vec<u8>, mime_type: String },
    /// Remote URL the provider fetches itself
    Url(String),
}

impl ImageInput {
    pub fn to_url(&self) -> String {
        match self {
            ImageInput::Bytes { data, mime_type } => format!(
                "data:{};base64,{}",
                mime_type,
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
            ImageInput::Url(url) => url.clone(),
        }
    }
}

/// Raw model output.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

/// Receives incremental text while a reply streams in.
pub type DeltaSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Capability port every model client implements.
#[async_trait]
pub trait ModelPort: Send + Sync {
    /// Model identifier recorded in traces.
    fn model(&self) -> &str;

    async fn structured_call(
        &self,
        request: &ModelRequest,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError>;

    async fn structured_call_with_image(
        &self,
        request: &ModelRequest,
        image: &ImageInput,
        on_delta: Option<DeltaSink>,
    ) -> Result<ModelReply, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_bytes_become_data_url() {
        let image = ImageInput::Bytes {
            data: b"png".to_vec(),
            mime_type: "image/png".to_string(),
        };
        assert_eq!(image.to_url(), "data:image/png;base64,cG5n");
    }

    #[test]
    fn test_multimodal_message_shape() {
        let request = ModelRequest::new("sys", "read this");
        let messages = request.messages_with_image(&ImageInput::Url("https://x/y.png".into()));
        let json = serde_json::to_value(&messages).unwrap();
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[1]["content"][0]["type"], "text");
        assert_eq!(json[1]["content"][1]["image_url"]["url"], "https://x/y.png");
    }

    #[test]
    fn test_empty_system_prompt_is_skipped() {
        let request = ModelRequest::new("  ", "hi");
        assert_eq!(request.messages().len(), 1);
    }
}
