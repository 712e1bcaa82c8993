//! Terminal-backed channel for adapter-free operation.
//!
//! Lines typed on the router's terminal arrive as messages in the fixed
//! `cli:local` chat; replies are printed to stdout. Useful for driving the
//! privileged workspace locally and for end-to-end smoke runs.

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::{AppError, Result};

use super::{Channel, InboundMessage};

/// Jid of the single terminal chat.
pub const CLI_CHAT_JID: &str = "cli:local";

/// Terminal channel.
pub struct CliChannel {
    operator_name: String,
}

impl CliChannel {
    /// Create a terminal channel posting messages under `operator_name`.
    #[must_use]
    pub fn new(operator_name: String) -> Self {
        Self { operator_name }
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn listen(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|err| AppError::Channel(format!("stdin read: {err}")))?;
            let Some(line) = line else {
                debug!("terminal stdin closed");
                return Ok(());
            };
            if line.trim().is_empty() {
                continue;
            }

            let msg = InboundMessage {
                id: Uuid::new_v4().to_string(),
                chat_jid: CLI_CHAT_JID.to_owned(),
                sender: "operator".to_owned(),
                sender_name: self.operator_name.clone(),
                content: line,
                timestamp: Utc::now(),
                from_self: false,
                chat_name: Some("terminal".to_owned()),
            };
            if tx.send(msg).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn send_message(&self, _chat_jid: &str, text: &str) -> Result<()> {
        println!("{text}");
        Ok(())
    }

    async fn set_typing(&self, _chat_jid: &str, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn sync_metadata(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}
