use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreakerConfig;
use crate::models::orchestrator::OrchestratorConfig;
use crate::models::provider::{GenerationOptions, MAX_TOKENS_CAP};

pub const ENV_PREFIX: &str = "LLM_RELAY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub providers: HashMap<String, ProviderConfig>,
    /// Provider name to API key. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub credentials: HashMap<String, String>,
    pub circuit_breaker: CircuitBreakerSettings,
    pub generation: GenerationSettings,
    pub fallback: FallbackSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    pub priority: i32, // Lower number = tried first
    pub default_model: String,
    /// Versioned API root, e.g. `https://api.openai.com/v1`. The client
    /// appends its own route (`/chat/completions`, `/messages`, `/models/...`).
    pub api_endpoint: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackSettings {
    pub attempt_timeout_ms: u64, // 0 disables the per-attempt timeout
    pub stream_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = HashMap::new();

        providers.insert("openai".to_string(), ProviderConfig {
            enabled: true,
            priority: 1,
            default_model: "gpt-3.5-turbo".to_string(),
            api_endpoint: None, // Uses default OpenAI endpoint
            timeout_seconds: 60,
        });

        providers.insert("anthropic".to_string(), ProviderConfig {
            enabled: true,
            priority: 2,
            default_model: "claude-2".to_string(),
            api_endpoint: None,
            timeout_seconds: 120,
        });

        providers.insert("gemini".to_string(), ProviderConfig {
            enabled: true,
            priority: 3,
            default_model: "gemini-1.5-flash".to_string(),
            api_endpoint: None,
            timeout_seconds: 120,
        });

        Self {
            providers,
            credentials: HashMap::new(),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 3,
                reset_timeout_secs: 30,
            },
            generation: GenerationSettings {
                default_model: "gpt-3.5-turbo".to_string(),
                temperature: 0.7,
                max_tokens: 1000,
            },
            fallback: FallbackSettings {
                attempt_timeout_ms: 30000,
                stream_fallback: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
            },
        }
    }
}

impl AppConfig {
    /// Layers built-in defaults, the TOML file at `path` (if present) and
    /// `LLM_RELAY_*` environment variables, in that order.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, Some(ENV_PREFIX))
    }

    pub fn load_with_env(path: &Path, env_prefix: Option<&str>) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
        } else {
            debug!("Config file {:?} not found, using defaults", path);
        }

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(File::from(path).format(FileFormat::Toml).required(false));

        if let Some(prefix) = env_prefix {
            builder = builder.add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, config_content).await?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, provider) in &self.providers {
            if provider.default_model.trim().is_empty() {
                return Err(Error::validation(format!("Provider {} has empty default_model", name)));
            }
            if provider.timeout_seconds == 0 {
                return Err(Error::validation(format!("Provider {} has zero timeout_seconds", name)));
            }
            if let Some(endpoint) = &provider.api_endpoint {
                url::Url::parse(endpoint).map_err(|e| {
                    Error::validation(format!("Provider {} has invalid api_endpoint {}: {}", name, endpoint, e))
                })?;
            }
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::validation("Circuit breaker failure_threshold must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.generation.temperature) {
            return Err(Error::validation("Temperature must be between 0 and 1"));
        }

        if self.generation.max_tokens == 0 || self.generation.max_tokens > MAX_TOKENS_CAP {
            return Err(Error::validation(format!("max_tokens must be between 1 and {}", MAX_TOKENS_CAP)));
        }

        if self.generation.default_model.trim().is_empty() {
            return Err(Error::validation("generation.default_model must not be empty"));
        }

        Ok(())
    }

    pub fn get_enabled_providers(&self) -> Vec<&str> {
        let mut enabled: Vec<_> = self.providers
            .iter()
            .filter(|(_, config)| config.enabled)
            .map(|(name, _)| name.as_str())
            .collect();
        enabled.sort();
        enabled
    }

    pub fn to_circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
        }
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            attempt_timeout: (self.fallback.attempt_timeout_ms > 0)
                .then(|| Duration::from_millis(self.fallback.attempt_timeout_ms)),
            stream_fallback: self.fallback.stream_fallback,
        }
    }

    pub fn to_generation_options(&self) -> GenerationOptions {
        GenerationOptions::new(self.generation.default_model.clone(), self.generation.temperature)
            .with_max_tokens(self.generation.max_tokens)
    }
}

/// Environment variable conventionally holding a provider's key, e.g. `OPENAI_API_KEY`.
pub fn credential_env_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_uppercase())
}
