//! Chat metadata and stored message models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for any conversation observed on a channel.
///
/// Created on first observation and updated on every message, whether or
/// not the chat is bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Chat {
    /// Channel-prefixed, globally unique chat identifier.
    pub jid: String,
    /// Human-readable chat name.
    pub name: String,
    /// Timestamp of the most recent message seen in this chat.
    pub last_message_time: Option<DateTime<Utc>>,
}

/// A single inbound message persisted in the store.
///
/// Full content is only stored for chats bound to a workspace; for other
/// chats the ingestion path records chat-level metadata alone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StoredMessage {
    /// Channel-unique message identifier.
    pub id: String,
    /// Owning chat.
    pub chat_jid: String,
    /// Opaque sender identifier.
    pub sender: String,
    /// Sender display name, used for self-filtering and prompt rendering.
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Channel timestamp; monotonic within a chat.
    pub timestamp: DateTime<Utc>,
    /// Whether the channel attributed this message to the assistant itself.
    pub from_self: bool,
}
