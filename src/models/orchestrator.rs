use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::provider::{ChatRequest, ChatResponse, ChatStream, GenerationOptions, StreamChunk};
use crate::models::registry::{Provider, ProviderRegistry};

pub const NOT_CONFIGURED_MESSAGE: &str =
    "I'm getting ready to help! Please ensure your API keys are configured.";
pub const EXHAUSTED_MESSAGE: &str =
    "I'll be ready to help you shortly! Please try again in a moment.";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a single provider attempt. `None` relies on the
    /// client's own HTTP timeout.
    pub attempt_timeout: Option<Duration>,
    /// Fall back to the next provider when a stream fails before its first chunk.
    pub stream_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Some(Duration::from_secs(30)),
            stream_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Generated,
    Greeting,
    NotConfigured,
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct FallbackAttempt {
    pub provider_name: String,
    pub model_name: String,
    pub attempt_number: usize,
    /// Why the attempt did not produce the answer, if it didn't.
    pub error: Option<String>,
    pub response_time_ms: u64,
    /// The provider answered without a transport error. An empty completion
    /// is still a success here, with `error` explaining why it was skipped.
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub text: String,
    pub outcome: GenerationOutcome,
    pub provider: Option<String>,
    pub attempts: Vec<FallbackAttempt>,
}

impl GenerationReport {
    fn canned(text: &str, outcome: GenerationOutcome, provider: Option<String>, attempts: Vec<FallbackAttempt>) -> Self {
        Self {
            text: text.to_string(),
            outcome,
            provider,
            attempts,
        }
    }
}

/// Routes prompts through the registry's providers in priority order.
///
/// `generate` always yields text: remote failures are recorded on the breaker
/// and absorbed, and the caller gets either a provider's answer or one of the
/// canned messages.
pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(registry: ProviderRegistry, config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.registry.breaker()
    }

    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> String {
        self.generate_with_report(prompt, options).await.text
    }

    pub async fn generate_with_report(&self, prompt: &str, options: &GenerationOptions) -> GenerationReport {
        if self.registry.is_empty() {
            warn!("No providers configured, returning setup message");
            return GenerationReport::canned(NOT_CONFIGURED_MESSAGE, GenerationOutcome::NotConfigured, None, Vec::new());
        }

        let available = self.registry.available_providers();
        debug!("{} of {} providers available", available.len(), self.registry.len());

        let mut attempts = Vec::new();

        for (index, provider) in available.iter().enumerate() {
            if prompt.trim().is_empty() {
                debug!("Blank prompt, answering with {} greeting", provider.name);
                return GenerationReport::canned(
                    provider.client.greeting(),
                    GenerationOutcome::Greeting,
                    Some(provider.name.clone()),
                    attempts,
                );
            }

            let model = provider.client.resolve_model(&options.model_name);
            let start_time = Instant::now();
            let result = self.attempt(provider, prompt, model.clone(), options).await;
            let response_time_ms = start_time.elapsed().as_millis() as u64;

            let mut attempt = FallbackAttempt {
                provider_name: provider.name.clone(),
                model_name: model,
                attempt_number: index + 1,
                error: None,
                response_time_ms,
                success: false,
            };

            match result {
                Ok(response) => {
                    self.breaker().record_success(&provider.name);
                    attempt.success = true;

                    if response.content.trim().is_empty() {
                        attempt.error = Some("empty completion".to_string());
                        attempts.push(attempt);
                        warn!("Provider {} returned an empty completion, trying next provider", provider.name);
                        continue;
                    }

                    attempts.push(attempt);
                    info!("Generated response using {} in {}ms", provider.name, response_time_ms);
                    return GenerationReport {
                        text: response.content,
                        outcome: GenerationOutcome::Generated,
                        provider: Some(provider.name.clone()),
                        attempts,
                    };
                }
                Err(e) => {
                    let failures = self.breaker().record_failure(&provider.name);
                    warn!(
                        "Provider {} failed (attempt {}/{}, {} consecutive failures): {}",
                        provider.name,
                        index + 1,
                        available.len(),
                        failures,
                        e
                    );
                    attempt.error = Some(e.to_string());
                    attempts.push(attempt);
                }
            }
        }

        error!("All fallback attempts failed. Attempts: {}", attempts.len());
        GenerationReport::canned(EXHAUSTED_MESSAGE, GenerationOutcome::Exhausted, None, attempts)
    }

    async fn attempt(
        &self,
        provider: &Provider,
        prompt: &str,
        model: String,
        options: &GenerationOptions,
    ) -> Result<ChatResponse> {
        let mut request = ChatRequest::from_prompt(prompt, model, options);
        let Some(limit) = self.config.attempt_timeout else {
            return provider.client.send_message(request).await;
        };

        request = request.with_timeout(limit);
        match timeout(limit, provider.client.send_message(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                provider: provider.name.clone(),
                timeout_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Lazily streams a completion. Nothing is contacted until the first
    /// `next_chunk` call.
    pub fn stream(&self, prompt: &str, options: GenerationOptions) -> OrchestratedStream {
        OrchestratedStream {
            registry: self.registry.clone(),
            config: self.config.clone(),
            prompt: prompt.to_string(),
            options,
            state: StreamState::Pending,
        }
    }
}

enum StreamState {
    Pending,
    Active { provider: String, inner: Box<dyn ChatStream> },
    Finished,
}

/// Chunk stream produced by [`Orchestrator::stream`].
///
/// Providers are tried in priority order until one yields a first chunk; from
/// then on that provider's chunks are forwarded as they arrive. An error after
/// the first chunk ends the stream. Dropping it closes the underlying response.
pub struct OrchestratedStream {
    registry: Arc<ProviderRegistry>,
    config: OrchestratorConfig,
    prompt: String,
    options: GenerationOptions,
    state: StreamState,
}

impl OrchestratedStream {
    pub fn active_provider(&self) -> Option<&str> {
        match &self.state {
            StreamState::Active { provider, .. } => Some(provider),
            _ => None,
        }
    }

    fn canned(&mut self, text: &str) -> Option<StreamChunk> {
        self.state = StreamState::Finished;
        Some(StreamChunk::text(uuid::Uuid::new_v4().to_string(), text))
    }

    async fn start(&mut self) -> Result<Option<StreamChunk>> {
        if self.registry.is_empty() {
            warn!("No providers configured, streaming setup message");
            return Ok(self.canned(NOT_CONFIGURED_MESSAGE));
        }

        let available = self.registry.available_providers();
        let breaker = self.registry.breaker().clone();

        for provider in &available {
            if self.prompt.trim().is_empty() {
                return Ok(self.canned(provider.client.greeting()));
            }

            debug!("Opening stream with provider {}", provider.name);
            match open_provider(provider, &self.prompt, &self.options, self.config.attempt_timeout).await {
                Ok((inner, Some(first))) => {
                    info!("Streaming response from {}", provider.name);
                    self.state = StreamState::Active {
                        provider: provider.name.clone(),
                        inner,
                    };
                    return Ok(Some(first));
                }
                Ok((_, None)) => {
                    // Provider answered but had nothing to say
                    breaker.record_success(&provider.name);
                    self.state = StreamState::Finished;
                    return Ok(None);
                }
                Err(e) => {
                    breaker.record_failure(&provider.name);
                    warn!("Provider {} failed before streaming began: {}", provider.name, e);
                    if !self.config.stream_fallback {
                        self.state = StreamState::Finished;
                        return Err(e);
                    }
                }
            }
        }

        error!("No provider could start a stream");
        Ok(self.canned(EXHAUSTED_MESSAGE))
    }
}

/// Opens a stream and waits for its first chunk, all under `attempt_timeout`.
async fn open_provider(
    provider: &Provider,
    prompt: &str,
    options: &GenerationOptions,
    attempt_timeout: Option<Duration>,
) -> Result<(Box<dyn ChatStream>, Option<StreamChunk>)> {
    let model = provider.client.resolve_model(&options.model_name);
    let request = ChatRequest::from_prompt(prompt, model, options).with_streaming();

    let handshake = async {
        let mut inner = provider.client.stream_message(request).await?;
        let first = inner.next_chunk().await?;
        Ok::<_, Error>((inner, first))
    };

    match attempt_timeout {
        Some(limit) => timeout(limit, handshake).await.map_err(|_| Error::Timeout {
            provider: provider.name.clone(),
            timeout_ms: limit.as_millis() as u64,
        })?,
        None => handshake.await,
    }
}

#[async_trait]
impl ChatStream for OrchestratedStream {
    async fn next_chunk(&mut self) -> Result<Option<StreamChunk>> {
        if matches!(self.state, StreamState::Pending) {
            return self.start().await;
        }

        match &mut self.state {
            StreamState::Pending | StreamState::Finished => Ok(None),
            StreamState::Active { provider, inner } => match inner.next_chunk().await {
                Ok(Some(chunk)) => Ok(Some(chunk)),
                Ok(None) => {
                    debug!("Stream from {} completed", provider);
                    self.registry.breaker().record_success(provider);
                    self.state = StreamState::Finished;
                    Ok(None)
                }
                Err(e) => {
                    warn!("Stream from {} failed mid-response: {}", provider, e);
                    self.registry.breaker().record_failure(provider);
                    self.state = StreamState::Finished;
                    Err(e)
                }
            },
        }
    }
}
