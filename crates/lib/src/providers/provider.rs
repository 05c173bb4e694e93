//! Provider capability set: the chat backend the relay sends through and listens on.

use async_trait::async_trait;

use crate::providers::inbound::{Inbound, Outbound};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("api error: {0}")]
    Api(String),
    #[error("{0}")]
    Config(String),
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
    #[error("provider not initialized")]
    NotInitialized,
    #[error("reading attachment: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway: {0}")]
    Gateway(String),
}

/// A chat backend. One implementation per platform, selected at startup by name.
///
/// `initialize` must complete before any other call. Inbound events authored by the
/// bot itself are never delivered.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name (e.g. "telegram").
    fn id(&self) -> &str;

    /// Establish connectivity and start delivering inbound events.
    async fn initialize(&self) -> Result<Inbound, ProviderError>;

    /// Stop connector tasks and release resources.
    async fn shutdown(&self);

    /// Transmit content; returns the platform id of the sent message.
    async fn send(&self, content: &Outbound) -> Result<String, ProviderError>;

    /// Attach a reaction-style marker to a sent message.
    async fn add_marker(&self, message_id: &str, symbol: &str) -> Result<(), ProviderError>;

    /// Remove a marker previously attached by `add_marker`. Default: unsupported.
    async fn remove_marker(&self, _message_id: &str, _symbol: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("marker removal"))
    }
}
