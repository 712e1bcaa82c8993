//! Persistent VM engine ("per-workspace disk").
//!
//! Each workspace keeps its own disk image, cloned lazily from a base
//! image, copy-on-write where the host filesystem supports it. One boot
//! per run executes an injected setup script that execs the agent; state
//! accumulates on the disk across runs. `reset` rebuilds the disk from
//! base; `stats` reports per-workspace disk usage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::{AppError, Result};

use super::{binary_on_path, Cleanup, EngineKind, ExecutionRequest, PreparedRun, SandboxEngine};

/// Persistent VM engine.
pub struct VibeEngine {
    base_image: PathBuf,
}

/// Disk usage for one workspace image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStats {
    /// Workspace folder the image belongs to.
    pub folder: String,
    /// Image size in bytes.
    pub bytes: u64,
}

impl VibeEngine {
    /// Create the engine with the given base image path.
    #[must_use]
    pub fn new(base_image: PathBuf) -> Self {
        Self { base_image }
    }

    /// Ensure the per-workspace disk exists, cloning from base when absent.
    async fn ensure_disk(&self, image: &Path) -> Result<()> {
        if image.exists() {
            return Ok(());
        }
        if !self.base_image.exists() {
            return Err(AppError::Sandbox(format!(
                "vibe base image missing: {}",
                self.base_image.display()
            )));
        }
        if let Some(parent) = image.parent() {
            std::fs::create_dir_all(parent)?;
        }
        clone_image(&self.base_image, image).await?;
        info!(image = %image.display(), "workspace disk cloned from base");
        Ok(())
    }

    /// Rebuild a workspace disk from the base image.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the base is missing or the copy fails.
    pub async fn reset(&self, image: &Path) -> Result<()> {
        if image.exists() {
            std::fs::remove_file(image)?;
        }
        self.ensure_disk(image).await
    }

    /// Disk usage for every workspace image under `images_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be read.
    pub fn stats(&self, images_dir: &Path) -> Result<Vec<ImageStats>> {
        let mut stats = Vec::new();
        if !images_dir.exists() {
            return Ok(stats);
        }
        for entry in std::fs::read_dir(images_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "raw") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            let bytes = entry.metadata()?.len();
            stats.push(ImageStats {
                folder: stem,
                bytes,
            });
        }
        stats.sort_by(|a, b| a.folder.cmp(&b.folder));
        Ok(stats)
    }
}

#[async_trait]
impl SandboxEngine for VibeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Vibe
    }

    fn available(&self) -> bool {
        binary_on_path("vibe")
    }

    async fn prepare(&self, req: &ExecutionRequest) -> Result<PreparedRun> {
        self.ensure_disk(&req.vm_image).await?;

        let script = setup_script(req);
        let script_path = req
            .vm_image
            .with_file_name(format!("{}-setup.sh", req.folder));
        std::fs::write(&script_path, script)?;

        let mut cmd = Command::new("vibe");
        cmd.arg("run")
            .arg("--disk")
            .arg(&req.vm_image)
            .arg("--share")
            .arg(format!("{}:/workspace/group", req.workspace_dir.display()))
            .arg("--share")
            .arg(format!("{}:/workspace/ipc", req.ipc_dir.display()))
            .arg("--setup-script")
            .arg(&script_path);
        if let Some(cpus) = req.cpus {
            cmd.arg("--cpus").arg(cpus.to_string());
        }
        if let Some(memory) = req.memory_mb {
            cmd.arg("--memory").arg(format!("{memory}M"));
        }

        let cleanup = Cleanup {
            commands: vec![vec![
                "rm".into(),
                "-f".into(),
                script_path.display().to_string(),
            ]],
        };

        Ok(PreparedRun {
            command: cmd,
            label: format!("vibe:{}", req.folder),
            background: Vec::new(),
            cleanup,
        })
    }
}

/// Setup script executed inside the guest on boot. Credentials are inlined
/// here rather than exported to the guest's persistent profile.
fn setup_script(req: &ExecutionRequest) -> String {
    let mut lines = vec!["#!/bin/sh".to_owned(), "set -eu".to_owned()];
    for (key, value) in &req.env {
        lines.push(format!("export {key}='{value}'"));
    }
    lines.push("cd /workspace/group".to_owned());
    lines.push(format!("exec {}", req.agent_cli.binary()));
    lines.join("\n") + "\n"
}

/// Copy-on-write clone where supported, plain copy otherwise.
async fn clone_image(base: &Path, target: &Path) -> Result<()> {
    let reflink = Command::new("cp")
        .arg("--reflink=auto")
        .arg(base)
        .arg(target)
        .output()
        .await;
    if matches!(reflink, Ok(ref out) if out.status.success()) {
        return Ok(());
    }

    // macOS `cp -c` uses clonefile; final fallback is a byte copy.
    let clonefile = Command::new("cp")
        .arg("-c")
        .arg(base)
        .arg(target)
        .output()
        .await;
    if matches!(clonefile, Ok(ref out) if out.status.success()) {
        return Ok(());
    }

    tokio::fs::copy(base, target)
        .await
        .map_err(|err| AppError::Sandbox(format!("image clone failed: {err}")))?;
    Ok(())
}
