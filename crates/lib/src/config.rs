//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.config/chatreply/config.json`) and environment.
//! Only provider selection and credentials live here; relay behavior comes from CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Name of the provider to relay through (e.g. "telegram", "discord").
    #[serde(default)]
    pub active_provider: String,

    /// Per-provider credentials.
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Per-provider config sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
}

/// Telegram provider config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Chat the lines are relayed to; only updates from this chat are watched.
    pub chat_id: Option<String>,
}

/// Discord provider config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordConfig {
    /// Bot token. Overridden by DISCORD_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// User the bot opens a direct-message channel with.
    pub user_id: Option<String>,
}

fn non_empty(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_non_empty("TELEGRAM_BOT_TOKEN")
        .or_else(|| non_empty(config.providers.telegram.bot_token.as_ref()))
}

/// Resolve the Discord bot token: env DISCORD_BOT_TOKEN overrides config.
pub fn resolve_discord_token(config: &Config) -> Option<String> {
    env_non_empty("DISCORD_BOT_TOKEN")
        .or_else(|| non_empty(config.providers.discord.bot_token.as_ref()))
}

pub fn resolve_telegram_chat_id(config: &Config) -> Option<String> {
    non_empty(config.providers.telegram.chat_id.as_ref())
}

pub fn resolve_discord_user_id(config: &Config) -> Option<String> {
    non_empty(config.providers.discord.user_id.as_ref())
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("CHATREPLY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::config_dir()
                .map(|d| d.join("chatreply").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or CHATREPLY_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Parse config JSON. An empty or whitespace-only document is the default config.
pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_json::from_str(s)?)
}
