use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, StreamChunk,
    TokenUsage, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE,
};
use crate::models::sse::SseReader;

pub const ANTHROPIC_DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-2";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_options(
            api_key,
            ANTHROPIC_DEFAULT_BASE_URL.to_string(),
            ANTHROPIC_DEFAULT_MODEL.to_string(),
            Duration::from_secs(120),
        )
    }

    pub fn with_options(
        api_key: String,
        base_url: String,
        default_model: String,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_model,
        })
    }

    /// System turns go into the top-level `system` field; everything else keeps
    /// its order.
    fn convert_messages(&self, messages: &[Message]) -> (Vec<AnthropicMessage>, Option<String>) {
        let mut anthropic_messages = Vec::new();
        let mut system_message = String::new();

        for message in messages {
            match message.role {
                MessageRole::System => {
                    if !system_message.is_empty() {
                        system_message.push('\n');
                    }
                    system_message.push_str(&message.content);
                }
                MessageRole::User | MessageRole::Assistant => {
                    anthropic_messages.push(AnthropicMessage {
                        role: message.role.as_str().to_string(),
                        content: message.content.clone(),
                    });
                }
            }
        }

        let system = (!system_message.is_empty()).then_some(system_message);
        (anthropic_messages, system)
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let (messages, system) = self.convert_messages(&request.messages);

        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            stream,
        }
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    async fn post(&self, body: &AnthropicRequest) -> Result<reqwest::Response> {
        debug!("Making Anthropic API request to model: {}", body.model);

        let response = self
            .client
            .post(self.messages_url())
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::model_provider(format!("Request failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        warn!("Anthropic API error: {} - {}", status, error_text);
        Err(Error::model_provider(format!("API error {}: {}", status, error_text)))
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start_time = Instant::now();

        let response: AnthropicResponse = self
            .post(&self.build_request(&request, false))
            .await?
            .json()
            .await
            .map_err(|e| Error::model_provider(format!("Failed to parse response: {}", e)))?;
        debug!("Received successful response from Anthropic API");

        let content = response.content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        if response.content.is_empty() {
            return Err(Error::model_provider("Response contained no content blocks"));
        }

        let usage = TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens);

        Ok(ChatResponse {
            id: response.id,
            request_id: request.id,
            model: response.model,
            content,
            role: MessageRole::Assistant,
            created_at: Utc::now(),
            usage: Some(usage),
            finish_reason: response.stop_reason,
            provider_metadata: serde_json::json!({
                "provider": "anthropic",
                "response_time_ms": start_time.elapsed().as_millis() as u64,
            }),
        })
    }

    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
        let response = self.post(&self.build_request(&request, true)).await?;
        Ok(Box::new(AnthropicStream::new(response)))
    }

    fn get_provider_name(&self) -> &str {
        "anthropic"
    }

    fn greeting(&self) -> &str {
        "I'm here to assist! What's on your mind?"
    }

    /// Model names from other vendors fall back to the configured Claude model.
    fn resolve_model(&self, requested: &str) -> String {
        if requested.starts_with("claude") {
            requested.to_string()
        } else {
            self.default_model.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Streaming events we act on. Anything else (`ping`, `content_block_start`,
/// ...) is skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart { message: AnthropicStreamMessage },
    ContentBlockDelta { delta: AnthropicDelta },
    MessageDelta {
        delta: AnthropicMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

pub struct AnthropicStream {
    reader: SseReader,
    message_id: String,
    done: bool,
}

impl AnthropicStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            reader: SseReader::new(response),
            message_id: String::new(),
            done: false,
        }
    }

    fn handle_event(&mut self, event: AnthropicStreamEvent) -> Result<Option<StreamChunk>> {
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                self.message_id = message.id;
                Ok(None)
            }
            AnthropicStreamEvent::ContentBlockDelta { delta } => Ok(delta
                .text
                .filter(|text| !text.is_empty())
                .map(|text| StreamChunk::text(self.message_id.clone(), text))),
            AnthropicStreamEvent::MessageDelta { delta, usage } => Ok(Some(StreamChunk {
                id: self.message_id.clone(),
                delta: String::new(),
                finish_reason: delta.stop_reason,
                usage: usage.map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            })),
            AnthropicStreamEvent::MessageStop => {
                self.done = true;
                Ok(None)
            }
            AnthropicStreamEvent::Error { error } => {
                self.done = true;
                Err(Error::model_provider(format!("Anthropic stream error: {}", error.message)))
            }
            AnthropicStreamEvent::Other => Ok(None),
        }
    }
}

#[async_trait]
impl ChatStream for AnthropicStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        while !self.done {
            let Some(event) = self.reader.next_event().await? else {
                self.done = true;
                break;
            };

            let parsed = match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Failed to parse Anthropic stream event: {} (data: {})", e, event.data);
                    continue;
                }
            };

            if let Some(chunk) = self.handle_event(parsed)? {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}
