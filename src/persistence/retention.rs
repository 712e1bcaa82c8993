//! Retention sweep: purges aged task run logs and messages of chats that
//! never became workspaces. Registered-chat history is kept; it is the
//! catch-up source.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::chat_repo::ChatRepo;
use super::task_repo::TaskRepo;

/// How often the sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Spawn the background retention task.
#[must_use]
pub fn spawn_retention_task(
    chats: ChatRepo,
    tasks: TaskRepo,
    retention_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention sweep shutting down");
                    break;
                }
                () = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }

            let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));

            match tasks.purge_run_logs(cutoff).await {
                Ok(purged) if purged > 0 => info!(purged, "task run logs purged"),
                Ok(_) => {}
                Err(err) => warn!(%err, "run log purge failed"),
            }

            match chats.purge_unregistered(cutoff).await {
                Ok(purged) if purged > 0 => info!(purged, "unregistered-chat messages purged"),
                Ok(_) => {}
                Err(err) => warn!(%err, "message purge failed"),
            }
        }
    })
}
