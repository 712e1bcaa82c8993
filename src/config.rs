//! Global configuration parsing, validation, and data-directory layout.
//!
//! Configuration comes from three layers, first non-empty wins:
//! per-group sandbox config (where applicable), a `settings` row in the
//! store, a `NANOCLAW_*` environment variable, then the TOML file defaults
//! below. The TOML file itself is optional; every field has a default so a
//! bare `nanoclaw` invocation works against `./data`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Settings keys recognized in the `settings` table and as `NANOCLAW_*`
/// environment variables (upper-cased).
pub mod keys {
    pub const CONTAINER_RUNTIME: &str = "container_runtime";
    pub const AGENT_RUNTIME: &str = "agent_runtime";
    pub const REQUIRE_TRIGGER: &str = "require_trigger";
    pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
    pub const SCHEDULER_INTERVAL_MS: &str = "scheduler_interval_ms";
    pub const IPC_INTERVAL_MS: &str = "ipc_interval_ms";
    pub const IDLE_TIMEOUT_MS: &str = "idle_timeout_ms";
    pub const CONTAINER_TIMEOUT_MS: &str = "container_timeout_ms";
    pub const MAX_OUTPUT_BYTES: &str = "max_output_bytes";
}

/// Look up the environment override for a settings key.
#[must_use]
pub fn env_override(key: &str) -> Option<String> {
    let var = format!("NANOCLAW_{}", key.to_uppercase());
    env::var(var).ok().filter(|v| !v.is_empty())
}

/// Timing intervals and byte caps, all overridable via settings/env.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimingConfig {
    /// Message loop tick interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Scheduler sweep interval.
    #[serde(default = "default_scheduler_interval_ms")]
    pub scheduler_interval_ms: u64,
    /// IPC dispatcher scan interval.
    #[serde(default = "default_ipc_interval_ms")]
    pub ipc_interval_ms: u64,
    /// Idle window after the last output frame before stdin is half-closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Wall-clock limit for one agent run.
    #[serde(default = "default_container_timeout_ms")]
    pub container_timeout_ms: u64,
    /// Per-stream (stdout, stderr) byte cap for agent output.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            scheduler_interval_ms: default_scheduler_interval_ms(),
            ipc_interval_ms: default_ipc_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            container_timeout_ms: default_container_timeout_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_scheduler_interval_ms() -> u64 {
    60_000
}

fn default_ipc_interval_ms() -> u64 {
    1_000
}

fn default_idle_timeout_ms() -> u64 {
    5_000
}

fn default_container_timeout_ms() -> u64 {
    300_000
}

fn default_max_output_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_workspaces_dir() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_main_folder() -> String {
    "main".into()
}

fn default_assistant_name() -> String {
    "Andy".into()
}

fn default_container_runtime() -> String {
    "auto".into()
}

fn default_agent_runtime() -> String {
    "claude".into()
}

fn default_container_image() -> String {
    "nanoclaw-agent:latest".into()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_retention_days() -> u32 {
    30
}

fn default_true() -> bool {
    true
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for durable state: store, sessions, IPC dirs, VM images.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Root for per-group agent working directories.
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,
    /// Folder name of the single privileged workspace.
    #[serde(default = "default_main_folder")]
    pub main_folder: String,
    /// Display name the assistant posts under; inbound messages from this
    /// sender are never fed back to the agent.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    /// Default trigger pattern for newly registered groups.
    #[serde(default)]
    pub default_trigger: Option<String>,
    /// Whether non-privileged groups require a trigger match by default.
    #[serde(default = "default_true")]
    pub require_trigger: bool,
    /// Sandbox engine selection: container | docker | tart | vibe | auto.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Agent CLI selection: claude | codex | opencode.
    #[serde(default = "default_agent_runtime")]
    pub agent_runtime: String,
    /// Container image used by the ephemeral-container engine.
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// Override the agent CLI invocation for the host engine (wrapper
    /// scripts, tests). First element is the binary.
    #[serde(default)]
    pub agent_command: Option<Vec<String>>,
    /// Env file holding agent credentials, outside every workspace.
    #[serde(default)]
    pub env_file: Option<PathBuf>,
    /// Mount allowlist JSON path; defaults to `<config dir>/mounts.json`.
    #[serde(default)]
    pub mount_policy_file: Option<PathBuf>,
    /// Enable the terminal-backed CLI channel.
    #[serde(default)]
    pub cli_channel: bool,
    /// Timing intervals and output caps.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Grace window for shutdown before child processes are killed.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Days before task run logs and unregistered-chat messages are purged;
    /// 0 disables the sweep.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            workspaces_dir: default_workspaces_dir(),
            main_folder: default_main_folder(),
            assistant_name: default_assistant_name(),
            default_trigger: None,
            require_trigger: true,
            container_runtime: default_container_runtime(),
            agent_runtime: default_agent_runtime(),
            container_image: default_container_image(),
            agent_command: None,
            env_file: None,
            mount_policy_file: None,
            cli_channel: false,
            timing: TimingConfig::default(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl GlobalConfig {
    /// Parse configuration from a TOML string and apply `NANOCLAW_*`
    /// environment overrides for the recognized settings keys.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path; a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            return Ok(config);
        }
        let text = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("cannot read '{}': {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_override(keys::CONTAINER_RUNTIME) {
            self.container_runtime = v;
        }
        if let Some(v) = env_override(keys::AGENT_RUNTIME) {
            self.agent_runtime = v;
        }
        if let Some(v) = env_override(keys::REQUIRE_TRIGGER) {
            self.require_trigger = v == "true";
        }
        for (key, slot) in [
            (keys::POLL_INTERVAL_MS, &mut self.timing.poll_interval_ms),
            (
                keys::SCHEDULER_INTERVAL_MS,
                &mut self.timing.scheduler_interval_ms,
            ),
            (keys::IPC_INTERVAL_MS, &mut self.timing.ipc_interval_ms),
            (keys::IDLE_TIMEOUT_MS, &mut self.timing.idle_timeout_ms),
            (
                keys::CONTAINER_TIMEOUT_MS,
                &mut self.timing.container_timeout_ms,
            ),
            (keys::MAX_OUTPUT_BYTES, &mut self.timing.max_output_bytes),
        ] {
            if let Some(v) = env_override(key) {
                if let Ok(parsed) = v.parse::<u64>() {
                    *slot = parsed;
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.main_folder.is_empty() {
            return Err(AppError::Config("main_folder must not be empty".into()));
        }
        if self.timing.poll_interval_ms == 0 || self.timing.ipc_interval_ms == 0 {
            return Err(AppError::Config("poll intervals must be non-zero".into()));
        }
        Ok(())
    }

    // ── Data-directory layout ───────────────────────────

    /// Path of the single-file store.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("nanoclaw.db")
    }

    /// Agent working directory for a workspace.
    #[must_use]
    pub fn workspace_dir(&self, folder: &str) -> PathBuf {
        self.workspaces_dir.join(folder)
    }

    /// Shared read-only directory mounted into non-privileged containers.
    #[must_use]
    pub fn global_workspace_dir(&self) -> PathBuf {
        self.workspaces_dir.join("global")
    }

    /// Agent home/session directory for a workspace.
    #[must_use]
    pub fn sessions_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("sessions").join(folder)
    }

    /// IPC root for a workspace, holding `messages/`, `tasks/`, `errors/`.
    #[must_use]
    pub fn ipc_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("ipc").join(folder)
    }

    /// Per-workspace VM disk image (persistent-VM engine).
    #[must_use]
    pub fn vm_image_path(&self, folder: &str) -> PathBuf {
        self.data_dir.join("vibe-images").join(format!("{folder}.raw"))
    }

    /// Mount allowlist JSON; intentionally outside every workspace so an
    /// agent cannot widen its own allowed mounts.
    #[must_use]
    pub fn mount_policy_path(&self) -> PathBuf {
        self.mount_policy_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("config").join("mounts.json"))
    }

    /// Whether `folder` is the privileged workspace.
    #[must_use]
    pub fn is_main(&self, folder: &str) -> bool {
        folder == self.main_folder
    }
}
