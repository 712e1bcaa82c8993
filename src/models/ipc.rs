//! Filesystem IPC request schemas.
//!
//! Each request is one JSON file under a workspace's `ipc/<folder>/` tree.
//! The `type` field is the discriminant. Field names follow the wire format
//! (camelCase for identifiers, snake_case for schedule fields); snake_case
//! aliases are accepted where agents have historically emitted them.
//!
//! The originating workspace is always derived from the directory the file
//! was found in; any source claim inside the payload is ignored.

use serde::Deserialize;

use super::group::SandboxConfig;

/// A parsed IPC request file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Send a chat message on the originating workspace's behalf.
    Message {
        #[serde(rename = "chatJid", alias = "chat_jid")]
        chat_jid: String,
        text: String,
    },
    /// Create a scheduled task.
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        #[serde(default)]
        context_mode: Option<String>,
        /// Target workspace; privileged only when not the caller's own.
        #[serde(default, rename = "groupFolder", alias = "group_folder")]
        group_folder: Option<String>,
        /// Target chat; defaults to the target workspace's chat.
        #[serde(default, rename = "chatJid", alias = "chat_jid")]
        chat_jid: Option<String>,
    },
    /// Pause an active task.
    PauseTask {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
    },
    /// Resume a paused task.
    ResumeTask {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
    },
    /// Cancel (delete) a task.
    CancelTask {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
    },
    /// Query one task; answered through the `tasks.json` snapshot.
    GetTask {
        #[serde(rename = "taskId", alias = "task_id")]
        task_id: String,
    },
    /// Query all visible tasks; answered through the `tasks.json` snapshot.
    ListTasks,
    /// Bind a chat to a new workspace. Privileged only.
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(default, rename = "requiresTrigger", alias = "requires_trigger")]
        requires_trigger: Option<bool>,
        #[serde(default, rename = "containerConfig", alias = "container_config")]
        container_config: Option<SandboxConfig>,
    },
    /// Force a channel metadata sync. Privileged only.
    RefreshGroups,
}
