//! Sandbox engines.
//!
//! Four interchangeable isolation strategies behind one contract: given an
//! [`ExecutionRequest`], an engine prepares a child command whose stdin will
//! receive the agent input JSON and whose stdout produces sentinel-framed
//! result records. The supervisor owns the process once prepared; engines
//! only describe how to start it and how to clean up afterwards.

pub mod container;
pub mod host;
pub mod runtime;
pub mod tart;
pub mod vibe;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::mounts::ResolvedMount;
use crate::{AppError, Result};

/// Agent CLI choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCli {
    Claude,
    Codex,
    Opencode,
}

impl AgentCli {
    /// Stable string form used in settings and per-group config.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
        }
    }

    /// Executable name invoked inside (or outside) the sandbox.
    #[must_use]
    pub fn binary(self) -> &'static str {
        self.as_str()
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::Opencode),
            other => Err(AppError::Config(format!("unknown agent runtime: {other}"))),
        }
    }
}

/// Sandbox engine kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// OS-native container runtime (`container`).
    Container,
    /// Cross-platform container runtime (`docker`).
    Docker,
    /// Ephemeral VM, fresh clone each run (`tart`).
    Tart,
    /// Persistent per-workspace disk VM (`vibe`).
    Vibe,
    /// No sandbox; direct CLI spawn. Privileged-operator use only.
    Host,
}

impl EngineKind {
    /// Stable string form used in settings and per-group config.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Docker => "docker",
            Self::Tart => "tart",
            Self::Vibe => "vibe",
            Self::Host => "host",
        }
    }

    /// Parse the stable string form. `auto` is resolved by the selector,
    /// not here.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "container" => Ok(Self::Container),
            "docker" => Ok(Self::Docker),
            "tart" => Ok(Self::Tart),
            "vibe" => Ok(Self::Vibe),
            "host" => Ok(Self::Host),
            other => Err(AppError::Config(format!(
                "unknown container runtime: {other}"
            ))),
        }
    }
}

/// Everything an engine needs to prepare one run.
#[derive(Debug)]
pub struct ExecutionRequest {
    /// Workspace folder.
    pub folder: String,
    /// Chat the run serves; engines only use it for labels.
    pub chat_jid: String,
    /// Whether this is the privileged workspace.
    pub privileged: bool,
    /// Agent CLI to invoke inside the sandbox.
    pub agent_cli: AgentCli,
    /// Host-engine invocation override (wrapper scripts, tests); first
    /// element is the binary. Sandboxed engines run the CLI from their
    /// image and ignore this.
    pub agent_command: Option<Vec<String>>,
    /// Policy-validated additional mounts.
    pub mounts: Vec<ResolvedMount>,
    /// Credential environment forwarded into the sandbox.
    pub env: Vec<(String, String)>,
    /// Wall-clock limit for the run.
    pub timeout: Duration,
    /// CPU count for VM engines.
    pub cpus: Option<u32>,
    /// Memory for VM engines, in MiB.
    pub memory_mb: Option<u32>,
    /// Image override for container and VM engines.
    pub image: Option<String>,
    /// Host path of the agent working directory.
    pub workspace_dir: PathBuf,
    /// Host path of the agent home/session directory.
    pub sessions_dir: PathBuf,
    /// Host path of the workspace's IPC root.
    pub ipc_dir: PathBuf,
    /// Host path of the shared read-only global workspace.
    pub global_dir: PathBuf,
    /// Host path of the project checkout, mounted read-write for the
    /// privileged workspace only.
    pub project_root: PathBuf,
    /// Host path of the per-workspace VM disk (persistent-VM engine).
    pub vm_image: PathBuf,
}

/// Commands executed after the child exits, regardless of how it exited.
/// Failures are logged, never propagated.
#[derive(Debug, Default)]
pub struct Cleanup {
    /// Argv lists, run in order.
    pub commands: Vec<Vec<String>>,
}

impl Cleanup {
    /// Run every cleanup command, ignoring failures.
    pub async fn run(&self) {
        for argv in &self.commands {
            let Some((bin, args)) = argv.split_first() else {
                continue;
            };
            match Command::new(bin).args(args).output().await {
                Ok(out) if !out.status.success() => {
                    tracing::debug!(command = ?argv, status = ?out.status, "cleanup command failed");
                }
                Err(err) => {
                    tracing::debug!(command = ?argv, %err, "cleanup command did not run");
                }
                Ok(_) => {}
            }
        }
    }
}

/// A prepared run: the supervised child command plus lifecycle extras.
pub struct PreparedRun {
    /// Command whose stdin/stdout carry the agent protocol.
    pub command: Command,
    /// Log label, e.g. `docker:family-1712345678901`.
    pub label: String,
    /// Background children (e.g. a booted VM) kept alive for the run.
    pub background: Vec<Child>,
    /// Unconditional post-exit cleanup.
    pub cleanup: Cleanup,
}

/// Common engine contract.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Which strategy this engine implements.
    fn kind(&self) -> EngineKind;

    /// Whether the engine's binary is present on this host.
    fn available(&self) -> bool;

    /// Prepare a child command for one run.
    async fn prepare(&self, req: &ExecutionRequest) -> Result<PreparedRun>;
}

/// Engine instances keyed by kind.
#[derive(Clone)]
pub struct EngineSet {
    engines: HashMap<EngineKind, Arc<dyn SandboxEngine>>,
}

impl EngineSet {
    /// Build the standard set of engines.
    #[must_use]
    pub fn standard(vibe_base_image: PathBuf) -> Self {
        let engines: Vec<Arc<dyn SandboxEngine>> = vec![
            Arc::new(container::ContainerEngine::native()),
            Arc::new(container::ContainerEngine::docker()),
            Arc::new(tart::TartEngine::new()),
            Arc::new(vibe::VibeEngine::new(vibe_base_image)),
            Arc::new(host::HostEngine::new()),
        ];
        Self {
            engines: engines.into_iter().map(|e| (e.kind(), e)).collect(),
        }
    }

    /// Look up an engine by kind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` for an unknown kind.
    pub fn get(&self, kind: EngineKind) -> Result<Arc<dyn SandboxEngine>> {
        self.engines
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::Sandbox(format!("no engine for {}", kind.as_str())))
    }

    /// Whether the engine for `kind` is usable on this host.
    #[must_use]
    pub fn available(&self, kind: EngineKind) -> bool {
        self.engines.get(&kind).is_some_and(|e| e.available())
    }
}

/// Environment variable names forwarded into sandboxes. Only agent
/// credentials; everything else from the host environment is stripped.
pub const CREDENTIAL_ENV_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
    "OPENAI_API_KEY",
    "OPENCODE_API_KEY",
];

/// Load the credential allowlist from an env file (`KEY=VALUE` lines,
/// `#` comments). Keys outside [`CREDENTIAL_ENV_VARS`] are ignored.
///
/// A missing file yields an empty environment; the sandbox then runs with
/// whatever credentials are baked into its image.
#[must_use]
pub fn load_credential_env(env_file: Option<&Path>) -> Vec<(String, String)> {
    let Some(path) = env_file else {
        return Vec::new();
    };
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };

    let mut env = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if CREDENTIAL_ENV_VARS.contains(&key) {
            env.push((key.to_owned(), value.trim().trim_matches('"').to_owned()));
        }
    }
    env
}

/// Whether `name` resolves to an executable on `$PATH`.
#[must_use]
pub fn binary_on_path(name: &str) -> bool {
    let Ok(path) = std::env::var("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}

/// Unique per-run name for clones and containers so a stuck cleanup never
/// collides with the next run.
#[must_use]
pub fn unique_run_name(folder: &str) -> String {
    format!("{folder}-{}", chrono::Utc::now().timestamp_millis())
}
