//! Agent process supervisor.
//!
//! Runs one prepared sandbox command to completion: writes the input JSON,
//! keeps stdin open and published for mid-run injection, streams sentinel
//! frames to the caller as they complete, and enforces the output cap, the
//! idle-close window, and the wall-clock deadline. Stdin half-close always
//! precedes child termination so a cooperative agent exits on its own.
//!
//! Cleanup (VM teardown, stray container removal) runs on every exit
//! path: success, failure, timeout, and shutdown.

use std::process::Stdio;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::LiveRegistry;
use crate::sandbox::{ExecutionRequest, SandboxEngine};
use crate::AppError;

use super::codec::{FrameCodec, OutputFrame, StreamItem};
use super::prompt::AgentInput;

/// Grace between stdin half-close and forceful kill on the abort paths.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Supervisor tunables, resolved per run.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorLimits {
    /// Wall-clock limit for the whole run.
    pub timeout: Duration,
    /// Idle window after the last frame before stdin is half-closed.
    pub idle_timeout: Duration,
    /// Per-stream output byte cap.
    pub max_output_bytes: u64,
}

/// Terminal result of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Child exited zero.
    Success,
    /// Spawn error, non-zero exit, stream error, timeout, or shutdown.
    Failure(String),
}

impl RunOutcome {
    /// Whether the run ended cleanly.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Run one agent process to completion, emitting each completed frame into
/// `frames` as soon as it parses.
pub async fn run_agent(
    engine: &dyn SandboxEngine,
    request: &ExecutionRequest,
    input: &AgentInput,
    limits: SupervisorLimits,
    live: &LiveRegistry,
    frames: mpsc::Sender<OutputFrame>,
    cancel: CancellationToken,
) -> RunOutcome {
    let mut prepared = match engine.prepare(request).await {
        Ok(p) => p,
        Err(err) => {
            warn!(folder = request.folder, %err, "sandbox preparation failed");
            return RunOutcome::Failure(err.to_string());
        }
    };

    let outcome = supervise(request, input, limits, live, &frames, &cancel, &mut prepared).await;

    live.clear(&request.folder).await;
    for bg in &mut prepared.background {
        bg.start_kill().ok();
    }
    prepared.cleanup.run().await;

    if let RunOutcome::Failure(ref reason) = outcome {
        warn!(
            folder = request.folder,
            label = prepared.label,
            reason,
            "agent run failed"
        );
    } else {
        debug!(folder = request.folder, label = prepared.label, "agent run completed");
    }
    outcome
}

#[allow(clippy::too_many_lines)] // One select loop; splitting it would scatter the state.
async fn supervise(
    request: &ExecutionRequest,
    input: &AgentInput,
    limits: SupervisorLimits,
    live: &LiveRegistry,
    frames: &mpsc::Sender<OutputFrame>,
    cancel: &CancellationToken,
    prepared: &mut crate::sandbox::PreparedRun,
) -> RunOutcome {
    prepared
        .command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match prepared.command.spawn() {
        Ok(c) => c,
        Err(err) => return RunOutcome::Failure(format!("spawn: {err}")),
    };

    info!(
        folder = request.folder,
        label = prepared.label,
        pid = child.id(),
        "agent process spawned"
    );

    let Some(mut stdin) = child.stdin.take() else {
        child.start_kill().ok();
        return RunOutcome::Failure("failed to capture stdin".into());
    };
    let Some(stdout) = child.stdout.take() else {
        child.start_kill().ok();
        return RunOutcome::Failure("failed to capture stdout".into());
    };
    let Some(stderr) = child.stderr.take() else {
        child.start_kill().ok();
        return RunOutcome::Failure("failed to capture stderr".into());
    };

    let payload = match serde_json::to_string(input) {
        Ok(json) => json,
        Err(err) => {
            child.start_kill().ok();
            return RunOutcome::Failure(format!("input encode: {err}"));
        }
    };
    if let Err(err) = stdin.write_all(format!("{payload}\n").as_bytes()).await {
        child.start_kill().ok();
        return RunOutcome::Failure(format!("stdin write: {err}"));
    }

    // Stdin stays open for mid-run injection; published so the message
    // loop can reach it and the idle/shutdown paths can half-close it.
    live.register(&request.folder, stdin, prepared.label.clone()).await;

    let stderr_task = spawn_stderr_logger(
        request.folder.clone(),
        stderr,
        limits.max_output_bytes,
    );

    let mut framed = FramedRead::new(stdout, FrameCodec::new());
    let deadline = tokio::time::Instant::now() + limits.timeout;
    let mut last_activity = tokio::time::Instant::now();
    let mut idle_closed = false;
    let mut truncated = false;

    let outcome = loop {
        let idle_at = last_activity + limits.idle_timeout;

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                live.close_stdin(&request.folder).await;
                break kill_after_grace(&mut child, "shutdown").await;
            }

            () = tokio::time::sleep_until(deadline) => {
                live.close_stdin(&request.folder).await;
                let _ = frames.send(OutputFrame::synthetic_error("timeout")).await;
                break kill_after_grace(&mut child, "timeout").await;
            }

            () = tokio::time::sleep_until(idle_at), if !idle_closed => {
                debug!(folder = request.folder, "idle window elapsed, half-closing stdin");
                live.close_stdin(&request.folder).await;
                idle_closed = true;
            }

            item = framed.next() => match item {
                None => {
                    // EOF: the agent finished writing; collect its status.
                    break wait_for_exit(&mut child, deadline).await;
                }
                Some(Ok(StreamItem::Frame(frame))) => {
                    last_activity = tokio::time::Instant::now();
                    if enforce_cap(&request.folder, &framed, limits.max_output_bytes, &mut truncated) {
                        continue;
                    }
                    if frames.send(frame).await.is_err() {
                        debug!(folder = request.folder, "frame receiver dropped");
                    }
                }
                Some(Ok(StreamItem::Diagnostic(line))) => {
                    last_activity = tokio::time::Instant::now();
                    enforce_cap(&request.folder, &framed, limits.max_output_bytes, &mut truncated);
                    debug!(folder = request.folder, line, "agent stdout (unframed)");
                }
                Some(Err(AppError::Agent(msg))) => {
                    // Oversized line; the codec resynchronizes on its own.
                    warn!(folder = request.folder, msg, "agent stdout framing error");
                }
                Some(Err(err)) => {
                    warn!(folder = request.folder, %err, "agent stdout read error");
                    break kill_after_grace(&mut child, "stream error").await;
                }
            }
        }
    };

    stderr_task.abort();
    outcome
}

/// Past-cap frames and diagnostics are dropped; the process lives on.
fn enforce_cap(
    folder: &str,
    framed: &FramedRead<tokio::process::ChildStdout, FrameCodec>,
    cap: u64,
    truncated: &mut bool,
) -> bool {
    if framed.decoder().bytes_consumed() <= cap {
        return false;
    }
    if !*truncated {
        warn!(folder, cap, "stdout cap exceeded, truncating further output");
        *truncated = true;
    }
    true
}

async fn wait_for_exit(child: &mut Child, deadline: tokio::time::Instant) -> RunOutcome {
    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    match tokio::time::timeout(remaining.max(KILL_GRACE), child.wait()).await {
        Ok(Ok(status)) if status.success() => RunOutcome::Success,
        Ok(Ok(status)) => RunOutcome::Failure(format!("exit status {status}")),
        Ok(Err(err)) => RunOutcome::Failure(format!("wait: {err}")),
        Err(_) => {
            child.kill().await.ok();
            RunOutcome::Failure("timeout waiting for exit".into())
        }
    }
}

/// Stdin is already half-closed by the caller; give the child a short
/// window to exit on its own before the forceful kill.
async fn kill_after_grace(child: &mut Child, reason: &str) -> RunOutcome {
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(%status, reason, "agent exited within grace window");
        }
        _ => {
            warn!(reason, "agent did not exit within grace window, killing");
            child.kill().await.ok();
        }
    }
    RunOutcome::Failure(reason.to_owned())
}

fn spawn_stderr_logger(
    folder: String,
    stderr: tokio::process::ChildStderr,
    cap: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut seen: u64 = 0;
        let mut truncated = false;
        while let Ok(Some(line)) = lines.next_line().await {
            seen += line.len() as u64 + 1;
            if seen > cap {
                if !truncated {
                    warn!(folder, cap, "stderr cap exceeded, truncating further output");
                    truncated = true;
                }
                continue;
            }
            debug!(folder, line, "agent stderr");
        }
    })
}
