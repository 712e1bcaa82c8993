//! Chat and message repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::chat::{Chat, StoredMessage};
use crate::Result;

use super::db::Database;
use super::{fmt_ts, parse_ts};

/// Repository for chat metadata and message rows.
#[derive(Clone)]
pub struct ChatRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    jid: String,
    name: String,
    last_message_time: Option<String>,
}

impl ChatRow {
    fn into_chat(self) -> Result<Chat> {
        let last_message_time = self
            .last_message_time
            .as_deref()
            .map(parse_ts)
            .transpose()?;
        Ok(Chat {
            jid: self.jid,
            name: self.name,
            last_message_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_jid: String,
    sender: String,
    sender_name: String,
    content: String,
    timestamp: String,
    from_self: i64,
}

impl MessageRow {
    fn into_message(self) -> Result<StoredMessage> {
        let timestamp = parse_ts(&self.timestamp)?;
        Ok(StoredMessage {
            id: self.id,
            chat_jid: self.chat_jid,
            sender: self.sender,
            sender_name: self.sender_name,
            content: self.content,
            timestamp,
            from_self: self.from_self != 0,
        })
    }
}

const MESSAGE_COLUMNS: &str = "id, chat_jid, sender, sender_name, content, timestamp, from_self";

impl ChatRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or refresh chat metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn upsert_chat(
        &self,
        jid: &str,
        name: &str,
        last_message_time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chats (jid, name, last_message_time) VALUES (?1, ?2, ?3)
             ON CONFLICT(jid) DO UPDATE SET
                name = excluded.name,
                last_message_time = excluded.last_message_time",
        )
        .bind(jid)
        .bind(name)
        .bind(fmt_ts(last_message_time))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Store a message. A replay of the same `(chat_jid, id)` replaces the
    /// existing row and is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_message(&self, msg: &StoredMessage) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO messages
                (id, chat_jid, sender, sender_name, content, timestamp, from_self)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&msg.id)
        .bind(&msg.chat_jid)
        .bind(&msg.sender)
        .bind(&msg.sender_name)
        .bind(&msg.content)
        .bind(fmt_ts(msg.timestamp))
        .bind(i64::from(msg.from_self))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Messages strictly after `since` across the given chats, excluding
    /// those sent by `self_name`, ordered by timestamp ascending. Returns
    /// the batch and the new watermark (`since` when the batch is empty).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn new_messages(
        &self,
        jids: &[String],
        since: DateTime<Utc>,
        self_name: &str,
    ) -> Result<(Vec<StoredMessage>, DateTime<Utc>)> {
        if jids.is_empty() {
            return Ok((Vec::new(), since));
        }

        let placeholders = (3..3 + jids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE timestamp > ?1 AND sender_name != ?2 AND from_self = 0
               AND chat_jid IN ({placeholders})
             ORDER BY timestamp ASC",
        );

        let mut query = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(fmt_ts(since))
            .bind(self_name);
        for jid in jids {
            query = query.bind(jid);
        }

        let rows = query.fetch_all(self.db.as_ref()).await?;
        let msgs: Vec<StoredMessage> = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<_>>()?;

        let new_max = msgs.last().map_or(since, |m| m.timestamp);
        Ok((msgs, new_max))
    }

    /// Messages strictly after `since` in one chat, excluding those sent by
    /// `self_name`, ordered ascending. The session catch-up window.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn messages_since(
        &self,
        chat_jid: &str,
        since: DateTime<Utc>,
        self_name: &str,
    ) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_jid = ?1 AND timestamp > ?2 AND sender_name != ?3 AND from_self = 0
             ORDER BY timestamp ASC",
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(chat_jid)
            .bind(fmt_ts(since))
            .bind(self_name)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// All chats ever observed, most recently active first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let rows: Vec<ChatRow> = sqlx::query_as(
            "SELECT jid, name, last_message_time FROM chats
             ORDER BY last_message_time DESC",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ChatRow::into_chat).collect()
    }

    /// Purge messages of chats that are not registered, older than `before`.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_unregistered(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE timestamp < ?1
               AND chat_jid NOT IN (SELECT jid FROM registered_groups)",
        )
        .bind(fmt_ts(before))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
