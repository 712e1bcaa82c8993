//! Per-workspace agent session handle.

use serde::{Deserialize, Serialize};

/// Opaque conversation-continuity handle for one workspace.
///
/// Created when the agent first emits one, updated on every run, never
/// expired. Isolated-context scheduled runs neither read nor write it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    /// Owning workspace folder.
    pub folder: String,
    /// Runtime-specific session identifier.
    pub session_id: String,
}
