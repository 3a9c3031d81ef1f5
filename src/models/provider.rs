use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const MAX_TOKENS_CAP: u32 = 4000;

pub const DEFAULT_GREETING: &str = "I'm ready to help! What would you like to know?";

/// Remote text-generation client. Implementations own the wire protocol; the
/// orchestrator only sees requests, responses and chunk streams.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse>;
    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>>;
    fn get_provider_name(&self) -> &str;

    /// Canned reply for a blank prompt. Returned without contacting the remote API.
    fn greeting(&self) -> &str {
        DEFAULT_GREETING
    }

    /// Maps the caller's requested model onto one this provider can serve.
    fn resolve_model(&self, requested: &str) -> String {
        requested.to_string()
    }
}

/// Caller-facing generation knobs. Out-of-range values are clamped when a
/// request is built, never rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl GenerationOptions {
    pub fn new(model_name: impl Into<String>, temperature: f32) -> Self {
        Self {
            model_name: model_name.into(),
            temperature,
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn clamped_temperature(&self) -> f32 {
        if self.temperature.is_nan() {
            DEFAULT_TEMPERATURE
        } else {
            self.temperature.clamp(0.0, 1.0)
        }
    }

    pub fn clamped_max_tokens(&self) -> u32 {
        self.max_tokens.min(MAX_TOKENS_CAP)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub id: String,
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>, model: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages,
            model,
            temperature: None,
            max_tokens: None,
            stream: false,
            timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Single user turn carrying `prompt`, with the options' clamped values applied.
    pub fn from_prompt(prompt: &str, model: String, options: &GenerationOptions) -> Self {
        Self::new(vec![Message::user(prompt.to_string())], model)
            .with_temperature(options.clamped_temperature())
            .with_max_tokens(options.clamped_max_tokens())
    }

    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub request_id: String,
    pub model: String,
    pub content: String,
    pub role: MessageRole,
    pub created_at: DateTime<Utc>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub provider_metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: String) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: String) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: String) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Pull-based chunk sequence. `Ok(None)` marks the end; dropping the stream
/// releases whatever connection backs it.
#[async_trait]
pub trait ChatStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn text(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            delta: delta.into(),
            finish_reason: None,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_default() {
        let options = GenerationOptions::default();
        assert_eq!(options.model_name, "gpt-3.5-turbo");
        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.max_tokens, 1000);
    }

    #[test]
    fn test_temperature_clamping() {
        assert_eq!(GenerationOptions::new("m", -0.5).clamped_temperature(), 0.0);
        assert_eq!(GenerationOptions::new("m", 1.7).clamped_temperature(), 1.0);
        assert_eq!(GenerationOptions::new("m", 0.3).clamped_temperature(), 0.3);
        assert_eq!(GenerationOptions::new("m", f32::NAN).clamped_temperature(), DEFAULT_TEMPERATURE);
    }

    #[test]
    fn test_max_tokens_capped() {
        let options = GenerationOptions::default().with_max_tokens(9000);
        assert_eq!(options.clamped_max_tokens(), MAX_TOKENS_CAP);

        let options = GenerationOptions::default().with_max_tokens(256);
        assert_eq!(options.clamped_max_tokens(), 256);
    }

    #[test]
    fn test_request_from_prompt() {
        let options = GenerationOptions::new("gpt-4", 3.0).with_max_tokens(10_000);
        let request = ChatRequest::from_prompt("Hello", "gpt-4".to_string(), &options);

        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.messages[0].role, MessageRole::User);
        assert_eq!(request.messages[0].content, "Hello");
        assert_eq!(request.temperature, Some(1.0));
        assert_eq!(request.max_tokens, Some(4000));
        assert!(!request.stream);
        assert!(request.with_streaming().stream);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }
}
