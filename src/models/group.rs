//! Registered group (workspace) model and per-group sandbox configuration.

use serde::{Deserialize, Serialize};

/// A requested additional bind mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    /// Host path; may start with `~` and is canonicalized by the policy.
    pub host_path: String,
    /// Path under `/workspace/extra/` inside the sandbox.
    pub guest_path: String,
    /// Requested read-only flag; the policy may force it on.
    #[serde(default)]
    pub readonly: bool,
}

/// Per-group sandbox overrides carried in `register_group` payloads and
/// stored alongside the group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    /// Engine override: container | docker | tart | vibe | host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Agent CLI override: claude | codex | opencode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_cli: Option<String>,
    /// Additional mounts, validated against the mount policy per run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<MountSpec>,
    /// Wall-clock limit override for this group's runs, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// CPU count for VM engines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Memory for VM engines, in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,
    /// Custom image name for container or VM engines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// A chat bound to an isolated execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RegisteredGroup {
    /// Bound chat identifier.
    pub jid: String,
    /// Display name.
    pub name: String,
    /// Filesystem-safe workspace folder; unique across groups.
    pub folder: String,
    /// Trigger regex that inbound content must match for non-privileged
    /// groups with `requires_trigger` set.
    pub trigger: Option<String>,
    /// Whether the trigger gate applies to this group.
    pub requires_trigger: bool,
    /// Sandbox overrides, if any.
    pub sandbox: Option<SandboxConfig>,
}

impl RegisteredGroup {
    /// Reject folder names that could escape the workspace roots.
    #[must_use]
    pub fn folder_is_safe(folder: &str) -> bool {
        !folder.is_empty()
            && folder
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}
