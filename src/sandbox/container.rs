//! Ephemeral container engine.
//!
//! One container per run, removed on exit. The same wrapper serves the
//! OS-native `container` CLI and `docker`; the two differ in read-only
//! bind grammar, normalized by [`ContainerFlavor::bind_arg`].
//!
//! Mount layout inside the container:
//!
//! | host | guest | mode |
//! |---|---|---|
//! | `workspaces/<folder>/` | `/workspace/group` | rw |
//! | project root (privileged only) | `/workspace/project` | rw |
//! | `workspaces/global/` (non-privileged only) | `/workspace/global` | ro |
//! | `sessions/<folder>/` | `/home/agent/.claude` | rw |
//! | `ipc/<folder>/` | `/workspace/ipc` | rw |
//! | validated extras | `/workspace/extra/<guest>` | per policy |

use async_trait::async_trait;
use tokio::process::Command;

use crate::Result;

use super::{
    binary_on_path, unique_run_name, Cleanup, EngineKind, ExecutionRequest, PreparedRun,
    SandboxEngine,
};

/// Which container CLI grammar to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFlavor {
    /// OS-native `container` runtime.
    Native,
    /// Cross-platform `docker`.
    Docker,
}

impl ContainerFlavor {
    fn binary(self) -> &'static str {
        match self {
            Self::Native => "container",
            Self::Docker => "docker",
        }
    }

    /// Render one bind mount in this flavor's grammar.
    fn bind_arg(self, host: &str, guest: &str, readonly: bool) -> Vec<String> {
        match self {
            Self::Docker => {
                let suffix = if readonly { ":ro" } else { "" };
                vec!["-v".into(), format!("{host}:{guest}{suffix}")]
            }
            Self::Native => {
                let ro = if readonly { ",readonly" } else { "" };
                vec![
                    "--mount".into(),
                    format!("type=bind,source={host},target={guest}{ro}"),
                ]
            }
        }
    }
}

/// Ephemeral container engine for one flavor.
pub struct ContainerEngine {
    flavor: ContainerFlavor,
}

impl ContainerEngine {
    /// OS-native `container` engine.
    #[must_use]
    pub fn native() -> Self {
        Self {
            flavor: ContainerFlavor::Native,
        }
    }

    /// `docker` engine.
    #[must_use]
    pub fn docker() -> Self {
        Self {
            flavor: ContainerFlavor::Docker,
        }
    }
}

#[async_trait]
impl SandboxEngine for ContainerEngine {
    fn kind(&self) -> EngineKind {
        match self.flavor {
            ContainerFlavor::Native => EngineKind::Container,
            ContainerFlavor::Docker => EngineKind::Docker,
        }
    }

    fn available(&self) -> bool {
        binary_on_path(self.flavor.binary())
    }

    async fn prepare(&self, req: &ExecutionRequest) -> Result<PreparedRun> {
        let name = unique_run_name(&req.folder);
        let image = req.image.as_deref().unwrap_or("nanoclaw-agent:latest");

        let mut cmd = Command::new(self.flavor.binary());
        cmd.arg("run")
            .arg("--rm")
            .arg("-i")
            .arg("--name")
            .arg(&name)
            .args(["-u", "1000:1000"]);

        let binds = self.binds(req);
        for (host, guest, readonly) in &binds {
            for arg in self.flavor.bind_arg(host, guest, *readonly) {
                cmd.arg(arg);
            }
        }

        for (key, value) in &req.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        cmd.arg(image).arg(req.agent_cli.binary());

        // `--rm` handles the success path; the force-remove covers a child
        // killed by timeout or shutdown.
        let cleanup = Cleanup {
            commands: vec![vec![
                self.flavor.binary().to_owned(),
                "rm".to_owned(),
                "-f".to_owned(),
                name.clone(),
            ]],
        };

        Ok(PreparedRun {
            command: cmd,
            label: format!("{}:{name}", self.flavor.binary()),
            background: Vec::new(),
            cleanup,
        })
    }
}

impl ContainerEngine {
    fn binds(&self, req: &ExecutionRequest) -> Vec<(String, String, bool)> {
        let mut binds = vec![(
            req.workspace_dir.display().to_string(),
            "/workspace/group".to_owned(),
            false,
        )];

        if req.privileged {
            binds.push((
                req.project_root.display().to_string(),
                "/workspace/project".to_owned(),
                false,
            ));
        } else {
            binds.push((
                req.global_dir.display().to_string(),
                "/workspace/global".to_owned(),
                true,
            ));
        }

        binds.push((
            req.sessions_dir.display().to_string(),
            "/home/agent/.claude".to_owned(),
            false,
        ));
        binds.push((
            req.ipc_dir.display().to_string(),
            "/workspace/ipc".to_owned(),
            false,
        ));

        for mount in &req.mounts {
            binds.push((
                mount.host_path.display().to_string(),
                format!("/workspace/extra/{}", mount.guest_path),
                mount.readonly,
            ));
        }

        binds
    }
}
