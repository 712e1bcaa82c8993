//! Channel capability boundary.
//!
//! Chat-protocol adapters live outside this crate; the router talks to them
//! through the [`Channel`] trait and receives inbound traffic as
//! [`InboundMessage`]s over an mpsc channel handed to [`Channel::listen`].
//! A [`ChannelSet`] fans several adapters into one inbound stream and
//! routes outbound sends to the adapter owning the chat's jid prefix.

pub mod cli;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::models::chat::StoredMessage;
use crate::{AppError, Result};

/// One inbound chat message as delivered by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Channel-unique message identifier.
    pub id: String,
    /// Channel-prefixed chat identifier.
    pub chat_jid: String,
    /// Opaque sender identifier.
    pub sender: String,
    /// Sender display name.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Channel timestamp.
    pub timestamp: DateTime<Utc>,
    /// Whether the adapter attributed the message to the assistant account.
    pub from_self: bool,
    /// Chat display name, when the adapter knows it.
    pub chat_name: Option<String>,
}

impl From<InboundMessage> for StoredMessage {
    fn from(msg: InboundMessage) -> Self {
        Self {
            id: msg.id,
            chat_jid: msg.chat_jid,
            sender: msg.sender,
            sender_name: msg.sender_name,
            content: msg.content,
            timestamp: msg.timestamp,
            from_self: msg.from_self,
        }
    }
}

/// Narrow interface every chat adapter implements.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Stable adapter name, used as the jid prefix and in logs.
    fn name(&self) -> &str;

    /// Establish the connection.
    async fn connect(&self) -> Result<()>;

    /// Run the inbound loop, pushing messages into `tx` until the stream
    /// ends or `tx` closes.
    async fn listen(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Deliver text to a chat.
    async fn send_message(&self, chat_jid: &str, text: &str) -> Result<()>;

    /// Toggle the typing indicator; adapters without one return `Ok`.
    async fn set_typing(&self, chat_jid: &str, on: bool) -> Result<()>;

    /// Bulk chat-metadata discovery, used by `refresh_groups`.
    async fn sync_metadata(&self, force: bool) -> Result<()>;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<()>;

    /// Whether a jid belongs to this adapter.
    fn owns(&self, chat_jid: &str) -> bool {
        chat_jid
            .split_once(':')
            .is_some_and(|(prefix, _)| prefix == self.name())
    }
}

/// A set of connected adapters behind one send/receive surface.
#[derive(Clone, Default)]
pub struct ChannelSet {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelSet {
    /// Build a set from adapters.
    #[must_use]
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    /// Whether any adapter is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Connect every adapter and spawn its listen loop onto `tx`.
    ///
    /// A failing adapter is logged and skipped; the router keeps running
    /// with whatever connected.
    pub async fn start(&self, tx: mpsc::Sender<InboundMessage>) {
        for ch in &self.channels {
            if let Err(err) = ch.connect().await {
                error!(channel = ch.name(), %err, "channel connect failed, skipping");
                continue;
            }
            let ch = Arc::clone(ch);
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Err(err) = ch.listen(tx).await {
                    error!(channel = ch.name(), %err, "channel listener exited");
                }
            });
        }
    }

    fn owner_of(&self, chat_jid: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|ch| ch.owns(chat_jid))
    }

    /// Deliver text to the adapter owning `chat_jid`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` when no adapter owns the jid or the send
    /// fails after the adapter's own retries.
    pub async fn send_message(&self, chat_jid: &str, text: &str) -> Result<()> {
        let Some(ch) = self.owner_of(chat_jid) else {
            return Err(AppError::Channel(format!("no channel owns jid {chat_jid}")));
        };
        ch.send_message(chat_jid, text).await
    }

    /// Best-effort typing indicator; failures are logged and swallowed.
    pub async fn set_typing(&self, chat_jid: &str, on: bool) {
        if let Some(ch) = self.owner_of(chat_jid) {
            if let Err(err) = ch.set_typing(chat_jid, on).await {
                warn!(chat_jid, %err, "set_typing failed");
            }
        }
    }

    /// Ask every adapter to refresh chat metadata.
    pub async fn sync_metadata(&self, force: bool) {
        for ch in &self.channels {
            if let Err(err) = ch.sync_metadata(force).await {
                warn!(channel = ch.name(), %err, "metadata sync failed");
            }
        }
    }

    /// Disconnect every adapter.
    pub async fn disconnect(&self) {
        for ch in &self.channels {
            if let Err(err) = ch.disconnect().await {
                warn!(channel = ch.name(), %err, "disconnect failed");
            }
        }
    }
}
