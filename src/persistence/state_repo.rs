//! Router cursor and settings repository.
//!
//! Cursors live in `router_state`: the store-wide `last_timestamp` watermark
//! under one key, and each workspace's agent cursor under
//! `agent_cursor:<folder>`. Free-form tuning values live in `settings`.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::Result;

use super::db::Database;
use super::{fmt_ts, parse_ts};

const LAST_TIMESTAMP_KEY: &str = "last_timestamp";

/// Repository for router state and settings.
#[derive(Clone)]
pub struct StateRepo {
    db: Arc<Database>,
}

impl StateRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM router_state WHERE key = ?1")
                .bind(key)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Store-wide "seen up to" watermark; the epoch when never set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn last_timestamp(&self) -> Result<DateTime<Utc>> {
        match self.get_state(LAST_TIMESTAMP_KEY).await? {
            Some(text) => parse_ts(&text),
            None => Ok(epoch()),
        }
    }

    /// Persist the store-wide watermark.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set_last_timestamp(&self, ts: DateTime<Utc>) -> Result<()> {
        self.set_state(LAST_TIMESTAMP_KEY, &fmt_ts(ts)).await
    }

    /// Latest message timestamp handed to this workspace's agent; the epoch
    /// when never set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn agent_cursor(&self, folder: &str) -> Result<DateTime<Utc>> {
        match self.get_state(&format!("agent_cursor:{folder}")).await? {
            Some(text) => parse_ts(&text),
            None => Ok(epoch()),
        }
    }

    /// Persist a workspace's agent cursor.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set_agent_cursor(&self, folder: &str, ts: DateTime<Utc>) -> Result<()> {
        self.set_state(&format!("agent_cursor:{folder}"), &fmt_ts(ts))
            .await
    }

    /// Read a settings row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(self.db.as_ref())
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// Write a settings row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).single().unwrap_or_default()
}
