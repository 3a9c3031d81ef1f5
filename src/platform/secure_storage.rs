use async_trait::async_trait;
use keyring::Entry;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const API_KEY_SERVICE: &str = "ai.valechat.llm-relay.api_keys";

#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;
    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>>;
    async fn delete(&self, service: &str, key: &str) -> Result<()>;
}

/// API keys kept in the OS credential store, one entry per provider.
pub struct SecureStorageManager {
    backend: Box<dyn SecureStorage>,
}

impl SecureStorageManager {
    pub fn new() -> Self {
        Self::with_backend(Box::new(KeyringStorage))
    }

    pub fn with_backend(backend: Box<dyn SecureStorage>) -> Self {
        Self { backend }
    }

    pub async fn store_api_key(&self, provider: &str, key: &str) -> Result<()> {
        debug!("Storing API key for provider: {}", provider);

        let result = self.backend.store(API_KEY_SERVICE, provider, key).await;
        if result.is_err() {
            warn!("Failed to store API key for provider: {}", provider);
        }
        result
    }

    pub async fn retrieve_api_key(&self, provider: &str) -> Result<Option<String>> {
        let result = self.backend.retrieve(API_KEY_SERVICE, provider).await;

        match &result {
            Ok(Some(_)) => debug!("Retrieved API key for provider: {}", provider),
            Ok(None) => debug!("No API key found for provider: {}", provider),
            Err(e) => warn!("Failed to retrieve API key for provider {}: {}", provider, e),
        }
        result
    }

    pub async fn delete_api_key(&self, provider: &str) -> Result<()> {
        debug!("Deleting API key for provider: {}", provider);

        let result = self.backend.delete(API_KEY_SERVICE, provider).await;
        if result.is_err() {
            warn!("Failed to delete API key for provider: {}", provider);
        }
        result
    }
}

impl Default for SecureStorageManager {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyringStorage;

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let entry = Entry::new(service, key)?;
        entry.set_password(value)?;
        Ok(())
    }

    async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
        let entry = Entry::new(service, key)?;
        match entry.get_password() {
            Ok(password) => Ok(Some(password)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }

    async fn delete(&self, service: &str, key: &str) -> Result<()> {
        let entry = Entry::new(service, key)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(Error::SecureStorage(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub(crate) struct MemoryStorage {
        entries: Mutex<HashMap<(String, String), String>>,
    }

    #[async_trait]
    impl SecureStorage for MemoryStorage {
        async fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
            self.entries.lock().insert((service.to_string(), key.to_string()), value.to_string());
            Ok(())
        }

        async fn retrieve(&self, service: &str, key: &str) -> Result<Option<String>> {
            Ok(self.entries.lock().get(&(service.to_string(), key.to_string())).cloned())
        }

        async fn delete(&self, service: &str, key: &str) -> Result<()> {
            self.entries.lock().remove(&(service.to_string(), key.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_api_key_roundtrip() {
        let storage = SecureStorageManager::with_backend(Box::new(MemoryStorage::default()));

        storage.store_api_key("openai", "sk-test123456789").await.unwrap();
        assert_eq!(
            storage.retrieve_api_key("openai").await.unwrap(),
            Some("sk-test123456789".to_string())
        );

        storage.delete_api_key("openai").await.unwrap();
        assert_eq!(storage.retrieve_api_key("openai").await.unwrap(), None);
    }
}
