use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE}};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, StreamChunk,
    TokenUsage,
};
use crate::models::sse::SseReader;

pub const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(api_key, OPENAI_DEFAULT_BASE_URL.to_string(), Duration::from_secs(60))
    }

    pub fn with_base_url(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::model_provider(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| Error::model_provider(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth_value);

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(headers)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OpenAIMessage> {
        messages.iter().map(|msg| OpenAIMessage {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }).collect()
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: request.model.clone(),
            messages: self.convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(stream),
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &OpenAIRequest) -> Result<reqwest::Response> {
        let url = self.completions_url();
        let headers = self.create_headers()?;

        let response = self.client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::model_provider(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: {} - {}", status, error_text);
            return Err(Error::model_provider(format!("API error {}: {}", status, error_text)));
        }

        Ok(response)
    }
}

#[async_trait]
impl ModelProvider for OpenAIProvider {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse> {
        debug!("Sending request to OpenAI: model={}, messages={}",
               request.model, request.messages.len());

        let start_time = Instant::now();
        let response = self.post(&self.build_request(&request, false)).await?;

        let response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| Error::model_provider(format!("Failed to parse response: {}", e)))?;
        debug!("OpenAI request {} completed in {:?}", response.id, start_time.elapsed());

        let choice = response.choices.into_iter().next()
            .ok_or_else(|| Error::model_provider("No choices in response"))?;

        let content = choice.message.content
            .ok_or_else(|| Error::model_provider("Response choice has no content"))?;

        let usage = response.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

        Ok(ChatResponse {
            id: response.id,
            request_id: request.id,
            model: response.model,
            content,
            role: MessageRole::Assistant,
            created_at: Utc::now(),
            usage,
            finish_reason: choice.finish_reason,
            provider_metadata: serde_json::json!({
                "provider": "openai",
                "created": response.created,
                "response_time_ms": start_time.elapsed().as_millis() as u64,
            }),
        })
    }

    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
        debug!("Starting streaming request to OpenAI: model={}, messages={}",
               request.model, request.messages.len());

        let response = self.post(&self.build_request(&request, true)).await?;
        Ok(Box::new(OpenAIStream::new(response)))
    }

    fn get_provider_name(&self) -> &str {
        "openai"
    }

    fn greeting(&self) -> &str {
        "I'm ready to help! What would you like to know?"
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    id: String,
    #[serde(default)]
    created: u64,
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    id: String,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamError {
    error: OpenAIErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorBody {
    message: String,
}

pub struct OpenAIStream {
    reader: SseReader,
    done: bool,
}

impl OpenAIStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            reader: SseReader::new(response),
            done: false,
        }
    }
}

/// Turns one `data:` payload into a chunk. `Ok(None)` means the payload carried
/// nothing worth forwarding.
fn parse_stream_data(data: &str) -> Result<Option<StreamChunk>> {
    match serde_json::from_str::<OpenAIStreamResponse>(data) {
        Ok(stream_response) => {
            let usage = stream_response.usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));

            let Some(choice) = stream_response.choices.into_iter().next() else {
                return Ok(None);
            };

            if choice.delta.content.is_none() && choice.finish_reason.is_none() {
                return Ok(None);
            }

            Ok(Some(StreamChunk {
                id: stream_response.id,
                delta: choice.delta.content.unwrap_or_default(),
                finish_reason: choice.finish_reason,
                usage,
            }))
        }
        Err(parse_error) => {
            if let Ok(api_error) = serde_json::from_str::<OpenAIStreamError>(data) {
                return Err(Error::model_provider(format!("OpenAI stream error: {}", api_error.error.message)));
            }
            debug!("Failed to parse stream response: {} (data: {})", parse_error, data);
            Ok(None)
        }
    }
}

#[async_trait]
impl ChatStream for OpenAIStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        while !self.done {
            let Some(event) = self.reader.next_event().await? else {
                self.done = true;
                break;
            };

            if event.data == "[DONE]" {
                self.done = true;
                break;
            }

            if let Some(chunk) = parse_stream_data(&event.data)? {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = OpenAIProvider::new("test-key".to_string());
        assert!(provider.is_ok());

        let provider = provider.unwrap();
        assert_eq!(provider.get_provider_name(), "openai");
        assert_eq!(provider.resolve_model("gpt-4"), "gpt-4");
    }

    #[test]
    fn test_message_conversion() {
        let provider = OpenAIProvider::new("test-key".to_string()).unwrap();

        let messages = vec![
            Message::system("You are a helpful assistant".to_string()),
            Message::user("Hello".to_string()),
        ];

        let converted = provider.convert_messages(&messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let provider = OpenAIProvider::with_base_url(
            "k".to_string(),
            "http://localhost:8080/".to_string(),
            Duration::from_secs(5),
        ).unwrap();
        assert_eq!(provider.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_completions_url_appends_to_versioned_root() {
        let provider = OpenAIProvider::new("k".to_string()).unwrap();
        assert_eq!(provider.completions_url(), "https://api.openai.com/v1/chat/completions");

        let provider = OpenAIProvider::with_base_url(
            "k".to_string(),
            "http://localhost:11434/v1/".to_string(),
            Duration::from_secs(5),
        ).unwrap();
        assert_eq!(provider.completions_url(), "http://localhost:11434/v1/chat/completions");
    }

    #[test]
    fn test_parse_stream_delta() {
        let data = r#"{"id":"c1","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk = parse_stream_data(data).unwrap().unwrap();
        assert_eq!(chunk.id, "c1");
        assert_eq!(chunk.delta, "Hel");
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn test_parse_stream_role_only_delta_is_skipped() {
        let data = r#"{"id":"c1","choices":[{"delta":{"role":"assistant"},"finish_reason":null}]}"#;
        assert!(parse_stream_data(data).unwrap().is_none());
    }

    #[test]
    fn test_parse_stream_finish() {
        let data = r#"{"id":"c1","choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk = parse_stream_data(data).unwrap().unwrap();
        assert_eq!(chunk.delta, "");
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_stream_error_payload() {
        let data = r#"{"error":{"message":"rate limited","type":"requests"}}"#;
        assert!(parse_stream_data(data).is_err());
    }
}
