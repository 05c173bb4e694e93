//! Chat providers (Telegram, Discord).
//!
//! Provider trait and registry so the relay can send lines, attach watch markers, and pull
//! inbound replies/reactions without knowing which platform carries them.

pub mod discord;
mod inbound;
mod provider;
mod registry;
pub mod telegram;

pub use discord::DiscordProvider;
pub use inbound::{
    Inbound, InboundEvent, InboundMessage, InboundReaction, InboundSender, Outbound,
};
pub use provider::{Provider, ProviderError};
pub use registry::{available, create_provider, ProviderFactory, ProviderRegistry};
pub use telegram::TelegramProvider;
