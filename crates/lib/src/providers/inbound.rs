//! Events flowing between a provider and the relay: inbound messages/reactions and outbound content.

use std::path::PathBuf;
use tokio::sync::mpsc;

/// A message posted by someone other than the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Id of the message this one replies to; empty when it is not a reply.
    pub referenced_id: String,
    pub content: String,
}

/// A reaction added by someone other than the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReaction {
    pub message_id: String,
    /// Symbolic value of the reaction (an emoji, or a custom emoji id).
    pub content: String,
}

/// Either inbound event shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    Reaction(InboundReaction),
}

impl InboundEvent {
    /// Id of the message the event responds to (empty for a non-reply message).
    pub fn referenced_id(&self) -> &str {
        match self {
            InboundEvent::Message(m) => &m.referenced_id,
            InboundEvent::Reaction(r) => &r.message_id,
        }
    }

    /// Response payload: message text or reaction symbol.
    pub fn payload(&self) -> &str {
        match self {
            InboundEvent::Message(m) => &m.content,
            InboundEvent::Reaction(r) => &r.content,
        }
    }
}

/// Pull-style event sources handed out by `Provider::initialize`.
///
/// Unbounded: nothing drains them during the send phase, and a connector task must keep
/// servicing its connection (heartbeats, long polls) while events pile up.
pub struct Inbound {
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
    pub reactions: mpsc::UnboundedReceiver<InboundReaction>,
}

impl Inbound {
    /// Create the two sources and the sender half a provider's connector task writes into.
    pub fn channel() -> (InboundSender, Inbound) {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (react_tx, react_rx) = mpsc::unbounded_channel();
        (
            InboundSender {
                messages: msg_tx,
                reactions: react_tx,
            },
            Inbound {
                messages: msg_rx,
                reactions: react_rx,
            },
        )
    }
}

/// Writing half of [`Inbound`], owned by a provider's connector task.
#[derive(Clone)]
pub struct InboundSender {
    pub messages: mpsc::UnboundedSender<InboundMessage>,
    pub reactions: mpsc::UnboundedSender<InboundReaction>,
}

impl InboundSender {
    /// Route an event to its source without waiting. Returns false once the receiving side is gone.
    pub fn forward(&self, event: InboundEvent) -> bool {
        match event {
            InboundEvent::Message(m) => self.messages.send(m).is_ok(),
            InboundEvent::Reaction(r) => self.reactions.send(r).is_ok(),
        }
    }
}

/// What a provider transmits for one input chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Upload this file as an attachment.
    File(PathBuf),
}

impl Outbound {
    /// A chunk naming an existing regular file is sent as that file unless `as_text` is set.
    pub fn from_chunk(chunk: &str, as_text: bool) -> Self {
        if as_text {
            return Outbound::Text(chunk.to_string());
        }
        let candidate = chunk.trim();
        match std::fs::metadata(candidate) {
            Ok(meta) if meta.is_file() => {
                log::debug!("sending {} as a file attachment", candidate);
                Outbound::File(PathBuf::from(candidate))
            }
            _ => Outbound::Text(chunk.to_string()),
        }
    }
}
