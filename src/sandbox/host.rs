//! In-process CLI engine.
//!
//! No sandbox: the agent CLI is spawned directly with the workspace as its
//! working directory and HOME pointed at the per-folder session directory.
//! Host filesystem exposure is unconstrained, so this engine is never
//! auto-selected and exists for a privileged operator's own use: fast
//! responses on the operator's machine, nothing more.

use async_trait::async_trait;
use tokio::process::Command;

use crate::Result;

use super::{
    binary_on_path, Cleanup, EngineKind, ExecutionRequest, PreparedRun, SandboxEngine,
};

/// Direct-spawn engine.
pub struct HostEngine;

impl HostEngine {
    /// Create the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for HostEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxEngine for HostEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Host
    }

    fn available(&self) -> bool {
        // Availability is the agent CLI itself; checked per run in prepare.
        true
    }

    async fn prepare(&self, req: &ExecutionRequest) -> Result<PreparedRun> {
        std::fs::create_dir_all(&req.workspace_dir)?;
        std::fs::create_dir_all(&req.sessions_dir)?;

        let mut cmd = match req.agent_command.as_deref() {
            Some([bin, args @ ..]) => {
                let mut cmd = Command::new(bin);
                cmd.args(args);
                cmd
            }
            _ => {
                if !binary_on_path(req.agent_cli.binary()) {
                    tracing::warn!(
                        cli = req.agent_cli.binary(),
                        "agent binary not found on PATH; spawn will fail"
                    );
                }
                Command::new(req.agent_cli.binary())
            }
        };
        cmd.current_dir(&req.workspace_dir)
            .env("HOME", &req.sessions_dir)
            .env("NANOCLAW_IPC_DIR", &req.ipc_dir);
        for (key, value) in &req.env {
            cmd.env(key, value);
        }

        Ok(PreparedRun {
            command: cmd,
            label: format!("host:{}", req.folder),
            background: Vec::new(),
            cleanup: Cleanup::default(),
        })
    }
}
