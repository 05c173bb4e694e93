//! Telegram provider: long-poll getUpdates for messages and reactions, Bot API for sending and markers.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{self, Config};
use crate::providers::inbound::{
    Inbound, InboundEvent, InboundMessage, InboundReaction, InboundSender, Outbound,
};
use crate::providers::provider::{Provider, ProviderError};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const ALLOWED_UPDATES: &str = r#"["message","message_reaction"]"#;

/// Bot API envelope: `{ "ok": bool, "result": T, "description": "..." }`.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub message_reaction: Option<TelegramReactionUpdate>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<TelegramMessageRef>,
}

/// Only the id of a replied-to message is needed.
#[derive(Debug, Deserialize)]
pub struct TelegramMessageRef {
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramReactionUpdate {
    pub chat: TelegramChat,
    pub message_id: i64,
    #[serde(default)]
    pub user: Option<TelegramUser>,
    #[serde(default)]
    pub new_reaction: Vec<TelegramReaction>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelegramReaction {
    Emoji { emoji: String },
    CustomEmoji { custom_emoji_id: String },
    #[serde(other)]
    Other,
}

/// Translate an update into an inbound event for `chat_id`, dropping anything authored by `bot_id`.
pub fn translate_update(update: TelegramUpdate, chat_id: &str, bot_id: i64) -> Option<InboundEvent> {
    if let Some(msg) = update.message {
        if msg.chat.id.to_string() != chat_id {
            log::debug!("telegram: ignoring message from chat {}", msg.chat.id);
            return None;
        }
        if msg.from.as_ref().map(|u| u.id) == Some(bot_id) {
            return None;
        }
        let referenced_id = msg
            .reply_to_message
            .map(|r| r.message_id.to_string())
            .unwrap_or_default();
        return Some(InboundEvent::Message(InboundMessage {
            id: msg.message_id.to_string(),
            referenced_id,
            content: msg.text.or(msg.caption).unwrap_or_default(),
        }));
    }
    if let Some(reaction) = update.message_reaction {
        if reaction.chat.id.to_string() != chat_id {
            log::debug!("telegram: ignoring reaction from chat {}", reaction.chat.id);
            return None;
        }
        if reaction.user.as_ref().map(|u| u.id) == Some(bot_id) {
            return None;
        }
        let content = match reaction.new_reaction.into_iter().next() {
            Some(TelegramReaction::Emoji { emoji }) => emoji,
            Some(TelegramReaction::CustomEmoji { custom_emoji_id }) => custom_emoji_id,
            Some(TelegramReaction::Other) => {
                log::debug!("telegram: unknown reaction type, skipping");
                return None;
            }
            // Reaction withdrawn.
            None => return None,
        };
        return Some(InboundEvent::Reaction(InboundReaction {
            message_id: reaction.message_id.to_string(),
            content,
        }));
    }
    None
}

/// Bot API client bound to one bot token and chat.
struct TelegramApi {
    api_base: String,
    token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramApi {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn read_response<T: DeserializeOwned>(
        &self,
        method: &str,
        res: reqwest::Response,
    ) -> Result<T, ProviderError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!(
                "{} failed: {} {}",
                method, status, body
            )));
        }
        let data: ApiResponse<T> = res.json().await?;
        if !data.ok {
            return Err(ProviderError::Api(format!(
                "{} returned ok: false ({})",
                method,
                data.description.unwrap_or_default()
            )));
        }
        data.result
            .ok_or_else(|| ProviderError::Api(format!("{} returned no result", method)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        self.read_response(method, res).await
    }

    async fn get_me(&self) -> Result<TelegramUser, ProviderError> {
        self.call("getMe", serde_json::json!({})).await
    }

    /// Call getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), ProviderError> {
        let mut query: Vec<(&str, String)> = vec![
            ("timeout", LONG_POLL_TIMEOUT.to_string()),
            ("allowed_updates", ALLOWED_UPDATES.to_string()),
        ];
        if let Some(off) = offset {
            query.push(("offset", off.to_string()));
        }
        let res = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .send()
            .await?;
        let updates: Vec<TelegramUpdate> = self.read_response("getUpdates", res).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset.or(offset)))
    }

    async fn send_text(&self, text: &str) -> Result<TelegramMessage, ProviderError> {
        self.call(
            "sendMessage",
            serde_json::json!({ "chat_id": self.chat_id, "text": text }),
        )
        .await
    }

    async fn send_document(&self, path: &std::path::Path) -> Result<TelegramMessage, ProviderError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("document", reqwest::multipart::Part::bytes(bytes).file_name(name));
        let res = self
            .client
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        self.read_response("sendDocument", res).await
    }

    /// setMessageReaction replaces the bot's reactions; an empty list clears them.
    async fn set_reaction(&self, message_id: &str, emoji: Option<&str>) -> Result<(), ProviderError> {
        let message_id: i64 = message_id.parse().map_err(|_| {
            ProviderError::Api(format!("invalid telegram message id: {}", message_id))
        })?;
        let reaction = match emoji {
            Some(e) => serde_json::json!([{ "type": "emoji", "emoji": e }]),
            None => serde_json::json!([]),
        };
        let _: bool = self
            .call(
                "setMessageReaction",
                serde_json::json!({
                    "chat_id": self.chat_id,
                    "message_id": message_id,
                    "reaction": reaction,
                }),
            )
            .await?;
        Ok(())
    }
}

/// Telegram provider: relays into one chat and watches it for replies and reactions.
pub struct TelegramProvider {
    id: String,
    api: Arc<TelegramApi>,
    running: Arc<AtomicBool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramProvider {
    pub fn new(token: String, chat_id: String) -> Self {
        Self {
            id: "telegram".to_string(),
            api: Arc::new(TelegramApi {
                api_base: telegram_api_base(),
                token,
                chat_id,
                client: reqwest::Client::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            poll_task: Mutex::new(None),
        }
    }

    /// Point the provider at a different Bot API server (tests, self-hosted API).
    pub fn with_api_base(self, api_base: impl Into<String>) -> Self {
        let api = TelegramApi {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: self.api.token.clone(),
            chat_id: self.api.chat_id.clone(),
            client: self.api.client.clone(),
        };
        Self {
            api: Arc::new(api),
            ..self
        }
    }

    pub fn from_config(config: &Config) -> Result<Arc<dyn Provider>, ProviderError> {
        let token = config::resolve_telegram_token(config)
            .ok_or_else(|| ProviderError::Config("telegram bot token not provided".to_string()))?;
        let chat_id = config::resolve_telegram_chat_id(config)
            .ok_or_else(|| ProviderError::Config("telegram chat id not provided".to_string()))?;
        Ok(Arc::new(Self::new(token, chat_id)))
    }
}

async fn run_get_updates_loop(
    api: Arc<TelegramApi>,
    running: Arc<AtomicBool>,
    bot_id: i64,
    tx: InboundSender,
) {
    let mut offset: Option<i64> = None;
    while running.load(Ordering::SeqCst) {
        match api.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next;
                for u in updates {
                    let Some(event) = translate_update(u, &api.chat_id, bot_id) else {
                        continue;
                    };
                    log::debug!("telegram: inbound event {:?}", event);
                    if !tx.forward(event) {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    log::info!("telegram provider: getUpdates loop stopped");
}

#[async_trait]
impl Provider for TelegramProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> Result<Inbound, ProviderError> {
        let me = self.api.get_me().await?;
        log::debug!("telegram: authenticated as bot {}", me.id);
        let (tx, inbound) = Inbound::channel();
        self.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(run_get_updates_loop(
            self.api.clone(),
            self.running.clone(),
            me.id,
            tx,
        ));
        if let Some(old) = self.poll_task.lock().await.replace(handle) {
            old.abort();
        }
        log::info!("telegram provider: getUpdates long-poll loop started");
        Ok(inbound)
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poll_task.lock().await.take() {
            // The loop may be parked in a 30s long poll; unconfirmed updates are redelivered anyway.
            handle.abort();
            let _ = handle.await;
        }
        log::debug!("telegram provider: shut down");
    }

    async fn send(&self, content: &Outbound) -> Result<String, ProviderError> {
        let sent = match content {
            Outbound::Text(text) => self.api.send_text(text).await?,
            Outbound::File(path) => self.api.send_document(path).await?,
        };
        Ok(sent.message_id.to_string())
    }

    async fn add_marker(&self, message_id: &str, symbol: &str) -> Result<(), ProviderError> {
        self.api.set_reaction(message_id, Some(symbol)).await
    }

    async fn remove_marker(&self, message_id: &str, _symbol: &str) -> Result<(), ProviderError> {
        self.api.set_reaction(message_id, None).await
    }
}

/// Resolve Telegram bot API base URL (TELEGRAM_API_BASE env for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
