pub mod anthropic;
pub mod circuit_breaker;
pub mod gemini;
pub mod openai;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod sse;

pub use provider::{
    ModelProvider, ChatRequest, ChatResponse, ChatStream, StreamChunk,
    GenerationOptions, Message, MessageRole, TokenUsage,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, ManualClock, SystemClock};
pub use orchestrator::{
    GenerationOutcome, GenerationReport, OrchestratedStream, Orchestrator, OrchestratorConfig,
    EXHAUSTED_MESSAGE, NOT_CONFIGURED_MESSAGE,
};
pub use registry::{Provider, ProviderRegistry};
pub use openai::OpenAIProvider;
pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
