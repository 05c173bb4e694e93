//! Initialize the configuration directory: create it and seed a template config file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{Config, DiscordConfig, ProvidersConfig, TelegramConfig};

/// Template written by `chatreply init`: both provider sections present with empty credentials.
pub fn template_config() -> Config {
    Config {
        active_provider: "telegram".to_string(),
        providers: ProvidersConfig {
            telegram: TelegramConfig {
                bot_token: Some(String::new()),
                chat_id: Some(String::new()),
            },
            discord: DiscordConfig {
                bot_token: Some(String::new()),
                user_id: Some(String::new()),
            },
        },
    }
}

/// Create the config directory and the template config file if they do not exist.
/// An existing config file is left untouched. Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!(
            "config file already exists at {}, skipping",
            config_path.display()
        );
    } else {
        let body = serde_json::to_string_pretty(&template_config())
            .context("serializing template config")?;
        std::fs::write(config_path, body)
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    Ok(config_dir.to_path_buf())
}
