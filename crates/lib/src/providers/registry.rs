//! Provider registry: build the configured provider by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::providers::discord::DiscordProvider;
use crate::providers::provider::{Provider, ProviderError};
use crate::providers::telegram::TelegramProvider;

/// Builds a provider from config, validating the settings it needs.
pub type ProviderFactory = fn(&Config) -> Result<Arc<dyn Provider>, ProviderError>;

/// Map of provider names to factories.
pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every provider shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("telegram", TelegramProvider::from_config);
        registry.register("discord", DiscordProvider::from_config);
        registry
    }

    /// Register a factory; replaces any factory already registered under `name`.
    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the provider named by `config.active_provider`.
    pub fn create(&self, config: &Config) -> Result<Arc<dyn Provider>, ProviderError> {
        let name = config.active_provider.trim();
        if name.is_empty() {
            return Err(ProviderError::Config(
                "no active provider specified".to_string(),
            ));
        }
        let factory = self.factories.get(name).ok_or_else(|| {
            ProviderError::Config(format!(
                "unsupported provider: {} (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        factory(config)
            .map_err(|e| ProviderError::Config(format!("error creating provider: {}", e)))
    }
}

/// Names of the providers shipped in this crate, sorted.
pub fn available() -> Vec<String> {
    ProviderRegistry::with_builtin().names()
}

/// Build the configured provider from the built-in registry.
pub fn create_provider(config: &Config) -> Result<Arc<dyn Provider>, ProviderError> {
    ProviderRegistry::with_builtin().create(config)
}
