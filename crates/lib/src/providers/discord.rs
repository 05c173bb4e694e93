//! Discord provider: REST for sending and reactions, Gateway WebSocket for inbound events.
//!
//! Lines are relayed to a direct-message channel with the configured user. The gateway
//! connection is not resumed; on Reconnect/Invalid Session the inbound sources close.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::{self, Config};
use crate::providers::inbound::{
    Inbound, InboundEvent, InboundMessage, InboundReaction, InboundSender, Outbound,
};
use crate::providers::provider::{Provider, ProviderError};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const GATEWAY_VERSION: &str = "10";
const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/chatreply, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// 429 responses retried per request before the rate limit is reported as an error.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
const INTENT_DIRECT_MESSAGES: u64 = 1 << 12;
const INTENT_DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

const INTENTS: u64 = INTENT_GUILD_MESSAGES
    | INTENT_GUILD_MESSAGE_REACTIONS
    | INTENT_DIRECT_MESSAGES
    | INTENT_DIRECT_MESSAGE_REACTIONS
    | INTENT_MESSAGE_CONTENT;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Gateway frame: `{ "op": u8, "d": any, "s": seq?, "t": event name? }`.
#[derive(Debug, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: serde_json::Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordUser {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DiscordChannel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GatewayBot {
    url: String,
}

#[derive(Debug, Deserialize)]
struct MessageCreate {
    id: String,
    channel_id: String,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    #[serde(default)]
    message_reference: Option<MessageReference>,
}

#[derive(Debug, Deserialize)]
struct MessageReference {
    #[serde(default)]
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReactionAdd {
    user_id: String,
    channel_id: String,
    message_id: String,
    emoji: Emoji,
}

#[derive(Debug, Deserialize)]
struct Emoji {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Translate a dispatch (op 0) event in `channel_id` into an inbound event, dropping the bot's own.
pub fn translate_dispatch(
    event_name: &str,
    data: &serde_json::Value,
    channel_id: &str,
    bot_id: &str,
) -> Option<InboundEvent> {
    match event_name {
        "MESSAGE_CREATE" => {
            let m: MessageCreate = match serde_json::from_value(data.clone()) {
                Ok(m) => m,
                Err(e) => {
                    log::debug!("discord: malformed MESSAGE_CREATE: {}", e);
                    return None;
                }
            };
            if m.channel_id != channel_id || m.author.id == bot_id {
                return None;
            }
            let referenced_id = m
                .message_reference
                .and_then(|r| r.message_id)
                .unwrap_or_default();
            Some(InboundEvent::Message(InboundMessage {
                id: m.id,
                referenced_id,
                content: m.content,
            }))
        }
        "MESSAGE_REACTION_ADD" => {
            let r: ReactionAdd = match serde_json::from_value(data.clone()) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("discord: malformed MESSAGE_REACTION_ADD: {}", e);
                    return None;
                }
            };
            if r.channel_id != channel_id || r.user_id == bot_id {
                return None;
            }
            let content = r.emoji.name.or(r.emoji.id)?;
            Some(InboundEvent::Reaction(InboundReaction {
                message_id: r.message_id,
                content,
            }))
        }
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

/// How long to wait before retrying a 429: `retry_after` from the JSON body, else the
/// `Retry-After` header, else one second. Both are in seconds; capped at one minute.
pub fn rate_limit_delay(retry_after_header: Option<&str>, body: &str) -> Duration {
    let seconds = serde_json::from_str::<RateLimited>(body)
        .map(|r| r.retry_after)
        .ok()
        .or_else(|| retry_after_header.and_then(|h| h.trim().parse::<f64>().ok()))
        .filter(|s| s.is_finite() && *s >= 0.0)
        .unwrap_or(1.0);
    Duration::try_from_secs_f64(seconds)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

fn heartbeat_frame(seq: Option<u64>) -> Message {
    Message::Text(serde_json::json!({ "op": OP_HEARTBEAT, "d": seq }).to_string())
}

fn identify_frame(token: &str) -> Message {
    Message::Text(
        serde_json::json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": token,
                "intents": INTENTS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "chatreply",
                    "device": "chatreply",
                }
            }
        })
        .to_string(),
    )
}

/// Session state learned during initialize.
struct DiscordSession {
    bot_id: String,
    channel_id: String,
}

/// Discord provider: relays into a DM channel with one user.
pub struct DiscordProvider {
    id: String,
    token: String,
    user_id: String,
    api_base: String,
    client: reqwest::Client,
    session: OnceLock<DiscordSession>,
    gateway_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscordProvider {
    pub fn new(token: String, user_id: String) -> Self {
        Self {
            id: "discord".to_string(),
            token,
            user_id,
            api_base: discord_api_base(),
            client: reqwest::Client::new(),
            session: OnceLock::new(),
            gateway_task: Mutex::new(None),
        }
    }

    /// Point the provider at a different REST API root (tests, proxies).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn from_config(config: &Config) -> Result<Arc<dyn Provider>, ProviderError> {
        let token = config::resolve_discord_token(config)
            .ok_or_else(|| ProviderError::Config("discord token not provided".to_string()))?;
        let user_id = config::resolve_discord_user_id(config)
            .ok_or_else(|| ProviderError::Config("discord user id not provided".to_string()))?;
        Ok(Arc::new(Self::new(token, user_id)))
    }

    fn channel_id(&self) -> Result<&str, ProviderError> {
        self.session
            .get()
            .map(|s| s.channel_id.as_str())
            .ok_or(ProviderError::NotInitialized)
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(reqwest::header::AUTHORIZATION, format!("Bot {}", self.token))
            .header(reqwest::header::USER_AGENT, USER_AGENT)
    }

    /// Send the request built by `build`, rebuilding and retrying it while Discord answers 429.
    async fn checked<F>(&self, what: &str, build: F) -> Result<reqwest::Response, ProviderError>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut retries = 0;
        loop {
            let res = self.authorized(build()).send().await?;
            let status = res.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS && retries < MAX_RATE_LIMIT_RETRIES {
                retries += 1;
                let header = res
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = res.text().await.unwrap_or_default();
                let delay = rate_limit_delay(header.as_deref(), &body);
                log::debug!(
                    "discord: {} rate limited, retry {}/{} in {:?}",
                    what,
                    retries,
                    MAX_RATE_LIMIT_RETRIES,
                    delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(ProviderError::Api(format!("{} failed: {} {}", what, status, body)));
            }
            return Ok(res);
        }
    }

    async fn json<T, F>(&self, what: &str, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        Ok(self.checked(what, build).await?.json().await?)
    }

    /// `/channels/{channel}/messages/{message}/reactions/{emoji}/@me`, with the emoji percent-encoded.
    fn reaction_url(&self, message_id: &str, symbol: &str) -> Result<reqwest::Url, ProviderError> {
        let base = format!(
            "{}/channels/{}/messages/{}/reactions",
            self.api_base,
            self.channel_id()?,
            message_id
        );
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| ProviderError::Api(format!("invalid reaction url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ProviderError::Api("reaction url cannot be a base".to_string()))?
            .push(symbol)
            .push("@me");
        Ok(url)
    }

    async fn open_gateway(&self) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>, u64), ProviderError> {
        let gateway_url = format!("{}/gateway/bot", self.api_base);
        let info: GatewayBot = self
            .json("get gateway", || self.client.get(&gateway_url))
            .await?;
        let url = format!("{}/?v={}&encoding=json", info.url, GATEWAY_VERSION);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ProviderError::Gateway(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let interval_ms = loop {
            let frame = stream
                .next()
                .await
                .ok_or_else(|| ProviderError::Gateway("closed before hello".to_string()))?
                .map_err(|e| ProviderError::Gateway(e.to_string()))?;
            let Message::Text(text) = frame else { continue };
            let payload: GatewayPayload = serde_json::from_str(&text)
                .map_err(|e| ProviderError::Gateway(format!("malformed frame: {}", e)))?;
            if payload.op == OP_HELLO {
                break payload
                    .d
                    .get("heartbeat_interval")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| ProviderError::Gateway("hello without heartbeat_interval".to_string()))?;
            }
        };

        sink.send(identify_frame(&self.token))
            .await
            .map_err(|e| ProviderError::Gateway(e.to_string()))?;
        Ok((sink, stream, interval_ms))
    }
}

async fn run_gateway_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    interval_ms: u64,
    channel_id: String,
    bot_id: String,
    tx: InboundSender,
) {
    let mut heartbeat = tokio::time::interval(Duration::from_millis(interval_ms));
    // The first tick completes immediately; Discord expects the first beat after one interval.
    heartbeat.tick().await;
    let mut seq: Option<u64> = None;
    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(heartbeat_frame(seq)).await {
                    log::warn!("discord: heartbeat failed: {}", e);
                    break;
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(reason))) => {
                        log::warn!("discord: gateway closed: {:?}", reason);
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("discord: gateway error: {}", e);
                        break;
                    }
                    None => break,
                };
                let payload: GatewayPayload = match serde_json::from_str(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        log::debug!("discord: malformed gateway frame: {}", e);
                        continue;
                    }
                };
                if payload.s.is_some() {
                    seq = payload.s;
                }
                match payload.op {
                    OP_DISPATCH => {
                        let name = payload.t.as_deref().unwrap_or_default();
                        let Some(event) = translate_dispatch(name, &payload.d, &channel_id, &bot_id) else {
                            continue;
                        };
                        log::debug!("discord: inbound event {:?}", event);
                        if !tx.forward(event) {
                            log::debug!("discord: inbound channel closed, stopping gateway loop");
                            break;
                        }
                    }
                    OP_HEARTBEAT => {
                        if let Err(e) = sink.send(heartbeat_frame(seq)).await {
                            log::warn!("discord: heartbeat failed: {}", e);
                            break;
                        }
                    }
                    OP_HEARTBEAT_ACK => {}
                    OP_RECONNECT | OP_INVALID_SESSION => {
                        log::warn!("discord: gateway asked to reconnect (op {}), inbound events stop", payload.op);
                        break;
                    }
                    other => log::debug!("discord: unhandled gateway op {}", other),
                }
            }
        }
    }
    let _ = sink.close().await;
    log::info!("discord provider: gateway loop stopped");
}

#[async_trait]
impl Provider for DiscordProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> Result<Inbound, ProviderError> {
        let me_url = format!("{}/users/@me", self.api_base);
        let me: DiscordUser = self
            .json("get current user", || self.client.get(&me_url))
            .await?;
        let channels_url = format!("{}/users/@me/channels", self.api_base);
        let recipient = serde_json::json!({ "recipient_id": self.user_id });
        let channel: DiscordChannel = self
            .json("create DM channel", || {
                self.client.post(&channels_url).json(&recipient)
            })
            .await?;
        log::debug!("discord: bot {} using DM channel {}", me.id, channel.id);

        let (sink, stream, interval_ms) = self.open_gateway().await?;
        let (tx, inbound) = Inbound::channel();
        let handle = tokio::spawn(run_gateway_loop(
            sink,
            stream,
            interval_ms,
            channel.id.clone(),
            me.id.clone(),
            tx,
        ));
        if let Some(old) = self.gateway_task.lock().await.replace(handle) {
            old.abort();
        }
        if self
            .session
            .set(DiscordSession {
                bot_id: me.id,
                channel_id: channel.id,
            })
            .is_err()
        {
            log::debug!("discord: already initialized, keeping the first session");
        }
        log::info!("discord provider: gateway connected");
        Ok(inbound)
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.gateway_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(s) = self.session.get() {
            log::debug!("discord provider: shut down (bot {})", s.bot_id);
        }
    }

    async fn send(&self, content: &Outbound) -> Result<String, ProviderError> {
        let url = format!("{}/channels/{}/messages", self.api_base, self.channel_id()?);
        let sent: SentMessage = match content {
            Outbound::Text(text) => {
                let body = serde_json::json!({ "content": text });
                self.json("send message", || self.client.post(&url).json(&body))
                    .await?
            }
            Outbound::File(path) => {
                let bytes = tokio::fs::read(path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string());
                // Multipart bodies are consumed on send, so each attempt builds its own form.
                self.json("send message", || {
                    let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(name.clone());
                    self.client
                        .post(&url)
                        .multipart(reqwest::multipart::Form::new().part("files[0]", part))
                })
                .await?
            }
        };
        Ok(sent.id)
    }

    async fn add_marker(&self, message_id: &str, symbol: &str) -> Result<(), ProviderError> {
        let url = self.reaction_url(message_id, symbol)?;
        self.checked("add reaction", || {
            self.client
                .put(url.clone())
                .header(reqwest::header::CONTENT_LENGTH, "0")
        })
        .await?;
        Ok(())
    }

    async fn remove_marker(&self, message_id: &str, symbol: &str) -> Result<(), ProviderError> {
        let url = self.reaction_url(message_id, symbol)?;
        self.checked("remove reaction", || self.client.delete(url.clone()))
            .await?;
        Ok(())
    }
}

/// Resolve the Discord REST API root (DISCORD_API_BASE env for tests or proxies).
pub fn discord_api_base() -> String {
    std::env::var("DISCORD_API_BASE")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| DISCORD_API_BASE.to_string())
}
