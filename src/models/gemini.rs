use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::{
    ChatRequest, ChatResponse, ChatStream, Message, MessageRole, ModelProvider, StreamChunk,
    TokenUsage,
};
use crate::models::sse::SseReader;

pub const GEMINI_DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_options(
            api_key,
            GEMINI_DEFAULT_BASE_URL.to_string(),
            GEMINI_DEFAULT_MODEL.to_string(),
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

    fn convert_messages(&self, messages: &[Message]) -> (Vec<GeminiContent>, Option<GeminiContent>) {
        let mut contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in messages {
            let role = match message.role {
                MessageRole::System => {
                    system_parts.push(GeminiPart { text: message.content.clone() });
                    continue;
                }
                MessageRole::User => "user",
                // Gemini calls the assistant "model"
                MessageRole::Assistant => "model",
            };
            contents.push(GeminiContent {
                role: Some(role.to_string()),
                parts: vec![GeminiPart { text: message.content.clone() }],
            });
        }

        let system = (!system_parts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system_parts,
        });
        (contents, system)
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let (contents, system_instruction) = self.convert_messages(&request.messages);

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        }
    }

    async fn post(&self, url: String, body: &GeminiRequest) -> Result<reqwest::Response> {
        let response = self.client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
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

        warn!("Gemini API error: {} - {}", status, error_text);
        Err(Error::model_provider(format!("API error {}: {}", status, error_text)))
    }
}

fn candidate_text(response: &GeminiResponse) -> Option<String> {
    let candidate = response.candidates.first()?;
    let text: String = candidate.content.as_ref()?
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect();
    Some(text)
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    async fn send_message(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start_time = Instant::now();
        let url = format!("{}/models/{}:generateContent", self.base_url, request.model);

        let response: GeminiResponse = self
            .post(url, &self.build_request(&request))
            .await?
            .json()
            .await
            .map_err(|e| Error::model_provider(format!("Failed to parse response: {}", e)))?;
        debug!("Received successful response from Gemini API");

        let content = candidate_text(&response)
            .ok_or_else(|| Error::model_provider("No candidates in response"))?;

        let usage = response.usage_metadata.as_ref().map(|u| TokenUsage::new(
            u.prompt_token_count,
            u.candidates_token_count,
        ));

        Ok(ChatResponse {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: request.id,
            model: request.model,
            content,
            role: MessageRole::Assistant,
            created_at: Utc::now(),
            usage,
            finish_reason: response.candidates
                .first()
                .and_then(|c| c.finish_reason.clone()),
            provider_metadata: serde_json::json!({
                "provider": "gemini",
                "response_time_ms": start_time.elapsed().as_millis() as u64,
            }),
        })
    }

    async fn stream_message(&self, request: ChatRequest) -> Result<Box<dyn ChatStream>> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let response = self.post(url, &self.build_request(&request)).await?;
        Ok(Box::new(GeminiStream {
            reader: SseReader::new(response),
            id: uuid::Uuid::new_v4().to_string(),
        }))
    }

    fn get_provider_name(&self) -> &str {
        "gemini"
    }

    fn resolve_model(&self, requested: &str) -> String {
        if requested.starts_with("gemini") {
            requested.to_string()
        } else {
            self.default_model.clone()
        }
    }
}

/// Each SSE event is a complete `GenerateContentResponse` holding the next
/// slice of text.
pub struct GeminiStream {
    reader: SseReader,
    id: String,
}

#[async_trait]
impl ChatStream for GeminiStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        while let Some(event) = self.reader.next_event().await? {
            if let Ok(api_error) = serde_json::from_str::<GeminiStreamError>(&event.data) {
                return Err(Error::model_provider(format!("Gemini stream error: {}", api_error.error.message)));
            }

            let response: GeminiResponse = match serde_json::from_str(&event.data) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Failed to parse Gemini stream event: {} (data: {})", e, event.data);
                    continue;
                }
            };

            let finish_reason = response.candidates.first().and_then(|c| c.finish_reason.clone());
            let delta = candidate_text(&response).unwrap_or_default();
            if delta.is_empty() && finish_reason.is_none() {
                continue;
            }

            return Ok(Some(StreamChunk {
                id: self.id.clone(),
                delta,
                finish_reason,
                usage: response.usage_metadata.map(|u| TokenUsage::new(
                    u.prompt_token_count,
                    u.candidates_token_count,
                )),
            }));
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

/// In-band error event, e.g. quota exhaustion after the stream has opened.
#[derive(Debug, Deserialize)]
struct GeminiStreamError {
    error: GeminiErrorBody,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorBody {
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
