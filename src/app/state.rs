use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::app::config::{credential_env_var, AppConfig};
use crate::error::Result;
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::orchestrator::Orchestrator;
use crate::models::registry::ProviderRegistry;
use crate::platform::SecureStorageManager;

pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    secure_storage: SecureStorageManager,
}

impl AppState {
    pub fn new(config: AppConfig, secure_storage: SecureStorageManager) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            secure_storage,
        }
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    pub async fn get_api_key(&self, provider: &str) -> Result<Option<String>> {
        self.secure_storage.retrieve_api_key(provider).await
    }

    pub async fn set_api_key(&self, provider: &str, api_key: &str) -> Result<()> {
        self.secure_storage.store_api_key(provider, api_key).await?;
        info!("API key stored for provider: {}", provider);
        Ok(())
    }

    pub async fn remove_api_key(&self, provider: &str) -> Result<()> {
        self.secure_storage.delete_api_key(provider).await?;
        info!("API key removed for provider: {}", provider);
        Ok(())
    }

    pub async fn resolve_credentials(&self) -> HashMap<String, String> {
        self.resolve_credentials_with(|name| std::env::var(name).ok()).await
    }

    /// For every enabled provider, the first non-blank of: the config file's
    /// `credentials` table, `<NAME>_API_KEY` from `env`, the OS keyring.
    /// Providers with no credential are left out.
    pub async fn resolve_credentials_with<F>(&self, env: F) -> HashMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = self.get_config();
        let mut credentials = HashMap::new();

        for name in config.get_enabled_providers() {
            let from_config = config.credentials.get(name).cloned().filter(|key| !key.trim().is_empty());
            let from_env = || env(&credential_env_var(name)).filter(|key| !key.trim().is_empty());

            let credential = match from_config.or_else(from_env) {
                Some(key) => Some(key),
                // Keyring failures are not fatal, the provider is simply unregistered
                None => self.get_api_key(name).await.ok().flatten().filter(|key| !key.trim().is_empty()),
            };

            match credential {
                Some(key) => {
                    credentials.insert(name.to_string(), key);
                }
                None => debug!("No credential found for provider: {}", name),
            }
        }

        credentials
    }

    pub async fn build_orchestrator(&self) -> Result<Orchestrator> {
        let credentials = self.resolve_credentials().await;
        self.build_orchestrator_with(&credentials)
    }

    pub fn build_orchestrator_with(&self, credentials: &HashMap<String, String>) -> Result<Orchestrator> {
        let config = self.get_config();
        let breaker = Arc::new(CircuitBreaker::new(config.to_circuit_breaker_config()));
        let registry = ProviderRegistry::from_config(&config, credentials, breaker)?;

        Ok(Orchestrator::new(registry, config.to_orchestrator_config()))
    }
}
