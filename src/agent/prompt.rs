//! Agent stdin protocol: input JSON and the message envelope.
//!
//! The initial stdin write is a single JSON object; the prompt inside it,
//! and every follow-up injected mid-run, is an XML-ish envelope of the
//! pending messages. Agents must tolerate repeated `<messages>` blocks on
//! one stdin stream.

use serde::Serialize;

use crate::models::chat::StoredMessage;
use crate::persistence::fmt_ts;

/// Initial stdin object handed to the agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    /// Message envelope or synthetic task prompt.
    pub prompt: String,
    /// Session to continue, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Workspace folder.
    pub group_folder: String,
    /// Chat the run serves.
    pub chat_jid: String,
    /// Whether this is the privileged workspace.
    pub is_main: bool,
    /// Set on scheduler-injected runs.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
}

/// Render pending messages as the stdin envelope.
#[must_use]
pub fn format_messages(msgs: &[StoredMessage]) -> String {
    let mut out = String::from("<messages>\n");
    for msg in msgs {
        out.push_str(&format!(
            "<message sender=\"{}\" time=\"{}\">{}</message>\n",
            xml_escape(&msg.sender_name),
            fmt_ts(msg.timestamp),
            xml_escape(&msg.content),
        ));
    }
    out.push_str("</messages>");
    out
}

/// Escape the characters with meaning in the envelope.
#[must_use]
pub fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

const INTERNAL_OPEN: &str = "<internal>";
const INTERNAL_CLOSE: &str = "</internal>";

/// Remove `<internal>…</internal>` spans from result text before it is
/// surfaced to a channel. An unterminated span drops the remainder.
#[must_use]
pub fn strip_internal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(INTERNAL_OPEN) {
        out.push_str(&rest[..start]);
        match rest[start..].find(INTERNAL_CLOSE) {
            Some(end) => rest = &rest[start + end + INTERNAL_CLOSE.len()..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_owned()
}
