//! Ephemeral VM engine ("one-shot").
//!
//! Every run clones the prepared base image, boots it, waits for address
//! assignment and a reachable shell, shares the workspace directory into
//! the guest, uploads session data and credentials, and execs the agent
//! CLI over SSH; the SSH process is the supervised child. Whatever way
//! the run ends, the clone is stopped and deleted. Zero residue, paid for
//! in boot latency.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{AppError, Result};

use super::{
    binary_on_path, unique_run_name, Cleanup, EngineKind, ExecutionRequest, PreparedRun,
    SandboxEngine,
};

/// Base image cloned for each run.
const BASE_IMAGE: &str = "nanoclaw-base";

/// Guest user baked into the base image.
const GUEST_USER: &str = "admin";

/// How long to wait for the guest to obtain an address.
const IP_WAIT: Duration = Duration::from_secs(90);

/// How long to wait for SSH to come up once the address is known.
const SSH_WAIT: Duration = Duration::from_secs(60);

const POLL_STEP: Duration = Duration::from_secs(2);

/// One-shot VM engine.
pub struct TartEngine;

impl TartEngine {
    /// Create the engine.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for TartEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxEngine for TartEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Tart
    }

    fn available(&self) -> bool {
        binary_on_path("tart")
    }

    async fn prepare(&self, req: &ExecutionRequest) -> Result<PreparedRun> {
        let clone = unique_run_name(&req.folder);
        let base = req.image.as_deref().unwrap_or(BASE_IMAGE);

        // The cleanup is valid from the moment the clone exists; return it
        // with the error path too so a half-booted clone never leaks.
        let cleanup = Cleanup {
            commands: vec![
                vec!["tart".into(), "stop".into(), clone.clone()],
                vec!["tart".into(), "delete".into(), clone.clone()],
            ],
        };

        match self.boot_and_connect(req, base, &clone).await {
            Ok(mut prepared) => {
                prepared.cleanup = cleanup;
                Ok(prepared)
            }
            Err(err) => {
                cleanup.run().await;
                Err(err)
            }
        }
    }
}

impl TartEngine {
    async fn boot_and_connect(
        &self,
        req: &ExecutionRequest,
        base: &str,
        clone: &str,
    ) -> Result<PreparedRun> {
        run_checked("tart", &["clone", base, clone]).await?;

        if let Some(cpus) = req.cpus {
            run_checked("tart", &["set", clone, "--cpu", &cpus.to_string()]).await?;
        }
        if let Some(memory) = req.memory_mb {
            run_checked("tart", &["set", clone, "--memory", &memory.to_string()]).await?;
        }

        // `tart run` blocks for the lifetime of the VM; keep it as a
        // background child so dropping the run tears the VM down.
        let boot = Command::new("tart")
            .arg("run")
            .arg(clone)
            .arg("--no-graphics")
            .arg(format!("--dir=group:{}", req.workspace_dir.display()))
            .arg(format!("--dir=ipc:{}", req.ipc_dir.display()))
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| AppError::Sandbox(format!("tart run spawn: {err}")))?;

        let ip = self.wait_for_ip(clone).await?;
        info!(clone, %ip, "vm booted");
        self.wait_for_ssh(&ip).await?;

        // Session data travels by archive; the workspace and IPC dirs are
        // directory shares and need no copy.
        self.upload_sessions(req, &ip).await?;

        let mut ssh = Command::new("ssh");
        ssh.args(ssh_options())
            .arg(format!("{GUEST_USER}@{ip}"))
            .arg(remote_invocation(req));

        Ok(PreparedRun {
            command: ssh,
            label: format!("tart:{clone}"),
            background: vec![boot],
            cleanup: Cleanup::default(),
        })
    }

    async fn wait_for_ip(&self, clone: &str) -> Result<String> {
        let deadline = tokio::time::Instant::now() + IP_WAIT;
        loop {
            if let Ok(out) = Command::new("tart").args(["ip", clone]).output().await {
                if out.status.success() {
                    let ip = String::from_utf8_lossy(&out.stdout).trim().to_owned();
                    if !ip.is_empty() {
                        return Ok(ip);
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Sandbox(format!(
                    "vm {clone} did not obtain an address within {IP_WAIT:?}"
                )));
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn wait_for_ssh(&self, ip: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + SSH_WAIT;
        loop {
            let probe = Command::new("ssh")
                .args(ssh_options())
                .arg(format!("{GUEST_USER}@{ip}"))
                .arg("true")
                .output()
                .await;
            if matches!(probe, Ok(ref out) if out.status.success()) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AppError::Sandbox(format!(
                    "ssh to {ip} not reachable within {SSH_WAIT:?}"
                )));
            }
            tokio::time::sleep(POLL_STEP).await;
        }
    }

    async fn upload_sessions(&self, req: &ExecutionRequest, ip: &str) -> Result<()> {
        if !req.sessions_dir.exists() {
            return Ok(());
        }
        let target = format!("{GUEST_USER}@{ip}:.claude");
        let mut scp = Command::new("scp");
        scp.args(ssh_options())
            .arg("-r")
            .arg(&req.sessions_dir)
            .arg(&target);
        let out = scp
            .output()
            .await
            .map_err(|err| AppError::Sandbox(format!("scp spawn: {err}")))?;
        if !out.status.success() {
            debug!(status = ?out.status, "session upload failed, agent starts fresh");
        }
        Ok(())
    }
}

fn ssh_options() -> [&'static str; 6] {
    [
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "LogLevel=ERROR",
    ]
}

/// Remote command line: credential exports, shared-dir links, then the
/// agent CLI reading the protocol on stdin.
fn remote_invocation(req: &ExecutionRequest) -> String {
    let mut parts = vec![
        "ln -sfn '/Volumes/My Shared Files/group' ~/workspace".to_owned(),
        "ln -sfn '/Volumes/My Shared Files/ipc' ~/ipc".to_owned(),
    ];
    let mut exec = String::from("exec env");
    for (key, value) in &req.env {
        exec.push_str(&format!(" {key}='{value}'"));
    }
    exec.push(' ');
    exec.push_str(req.agent_cli.binary());
    parts.push(exec);
    parts.join(" && ")
}

async fn run_checked(bin: &str, args: &[&str]) -> Result<()> {
    let out = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|err| AppError::Sandbox(format!("{bin} spawn: {err}")))?;
    if !out.status.success() {
        return Err(AppError::Sandbox(format!(
            "{bin} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}
