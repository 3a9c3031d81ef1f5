use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::app::config::{AppConfig, ProviderConfig};
use crate::error::{Error, Result};
use crate::models::anthropic::{AnthropicProvider, ANTHROPIC_DEFAULT_BASE_URL};
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::gemini::{GeminiProvider, GEMINI_DEFAULT_BASE_URL};
use crate::models::openai::{OpenAIProvider, OPENAI_DEFAULT_BASE_URL};
use crate::models::provider::ModelProvider;

pub const KNOWN_PROVIDERS: [&str; 3] = ["openai", "anthropic", "gemini"];

/// A registered backend: its breaker key, its place in the fallback order and
/// the client that talks to it.
#[derive(Clone)]
pub struct Provider {
    pub name: String,
    pub priority: i32,
    pub client: Arc<dyn ModelProvider>,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Providers ordered by ascending priority, sharing one circuit breaker.
#[derive(Debug)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    breaker: Arc<CircuitBreaker>,
}

impl ProviderRegistry {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            providers: Vec::new(),
            breaker,
        }
    }

    /// Registers every enabled, known provider whose credential is non-blank.
    pub fn from_config(
        config: &AppConfig,
        credentials: &HashMap<String, String>,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let mut registry = Self::new(breaker);

        for name in credentials.keys() {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                warn!("Ignoring credential for unknown provider: {}", name);
            }
        }

        for name in KNOWN_PROVIDERS {
            let Some(provider_config) = config.providers.get(name) else {
                continue;
            };
            if !provider_config.enabled {
                debug!("Provider {} disabled in configuration", name);
                continue;
            }

            let credential = credentials.get(name).map(String::as_str).unwrap_or_default();
            registry.register_with_credential(
                name,
                provider_config.priority,
                credential,
                |api_key| build_client(name, api_key, provider_config),
            )?;
        }

        info!(
            "Provider registry ready: [{}]",
            registry.providers.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, priority: i32, client: Arc<dyn ModelProvider>) {
        let name = name.into();
        debug!("Registering provider {} with priority {}", name, priority);

        self.providers.push(Provider { name, priority, client });
        // Stable sort keeps insertion order for equal priorities
        self.providers.sort_by_key(|p| p.priority);
    }

    /// Returns `false` without registering anything when the credential is
    /// empty or whitespace.
    pub fn register_with_credential<F>(
        &mut self,
        name: &str,
        priority: i32,
        credential: &str,
        factory: F,
    ) -> Result<bool>
    where
        F: FnOnce(String) -> Result<Arc<dyn ModelProvider>>,
    {
        let credential = credential.trim();
        if credential.is_empty() {
            debug!("No credential for provider {}, skipping registration", name);
            return Ok(false);
        }

        let client = factory(credential.to_string())?;
        self.register(name, priority, client);
        Ok(true)
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_available(&self, provider: &Provider) -> bool {
        !self.breaker.is_open(&provider.name)
    }

    /// Providers whose circuit is currently closed, in priority order.
    pub fn available_providers(&self) -> Vec<Provider> {
        self.providers
            .iter()
            .filter(|provider| {
                let available = self.is_available(provider);
                if !available {
                    debug!("Skipping provider {}: circuit open", provider.name);
                }
                available
            })
            .cloned()
            .collect()
    }
}

fn build_client(name: &str, api_key: String, config: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    let timeout = Duration::from_secs(config.timeout_seconds);

    let client: Arc<dyn ModelProvider> = match name {
        "openai" => Arc::new(OpenAIProvider::with_base_url(
            api_key,
            config.api_endpoint.clone().unwrap_or_else(|| OPENAI_DEFAULT_BASE_URL.to_string()),
            timeout,
        )?),
        "anthropic" => Arc::new(AnthropicProvider::with_options(
            api_key,
            config.api_endpoint.clone().unwrap_or_else(|| ANTHROPIC_DEFAULT_BASE_URL.to_string()),
            config.default_model.clone(),
            timeout,
        )?),
        "gemini" => Arc::new(GeminiProvider::with_options(
            api_key,
            config.api_endpoint.clone().unwrap_or_else(|| GEMINI_DEFAULT_BASE_URL.to_string()),
            config.default_model.clone(),
            timeout,
        )?),
        other => return Err(Error::model_provider(format!("Unknown provider type: {}", other))),
    };
    Ok(client)
}
