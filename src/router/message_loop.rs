//! Message loop: polls the store for new channel messages and fans them
//! out to workspaces.
//!
//! Per tick: fetch everything after the store-wide watermark, persist the
//! advanced watermark *first* (it is the "seen" mark and must be monotonic
//! even when later steps fail), then per chat apply the trigger gate,
//! compute the catch-up window from the per-workspace agent cursor, and
//! either pipe the window into a live run's stdin or enqueue a run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::prompt::format_messages;
use crate::models::chat::StoredMessage;
use crate::models::group::RegisteredGroup;
use crate::queue::GroupRunner;
use crate::Result;

use super::{effective_require_trigger, group_requires_trigger, Router};

/// Spawn the message loop.
#[must_use]
pub fn spawn(router: Arc<Router>) -> JoinHandle<()> {
    let cancel: CancellationToken = router.ctx.cancel.clone();
    let interval = Duration::from_millis(router.ctx.config.timing.poll_interval_ms);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("message loop shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = tick(&router).await {
                warn!(%err, "message loop tick failed");
            }
        }
    })
}

/// One polling pass. Public for integration tests.
///
/// # Errors
///
/// Returns an error when the store is unreachable; per-group failures are
/// logged and do not abort the tick.
pub async fn tick(router: &Arc<Router>) -> Result<()> {
    let ctx = &router.ctx;
    let jids = ctx.registered_jids();
    if jids.is_empty() {
        return Ok(());
    }

    let since = ctx.state.last_timestamp().await?;
    let (msgs, new_max) = ctx
        .chats
        .new_messages(&jids, since, &ctx.config.assistant_name)
        .await?;
    if msgs.is_empty() {
        return Ok(());
    }

    // Watermark first: these messages now count as seen no matter what
    // happens below. Recovery leans on the per-workspace cursors.
    ctx.state.set_last_timestamp(new_max).await?;

    let mut by_chat: BTreeMap<String, Vec<StoredMessage>> = BTreeMap::new();
    for msg in msgs {
        by_chat.entry(msg.chat_jid.clone()).or_default().push(msg);
    }

    let require_trigger = effective_require_trigger(ctx).await;
    for (jid, batch) in by_chat {
        let Some(group) = ctx.group_by_jid(&jid) else {
            continue;
        };

        if group_requires_trigger(&ctx.config, require_trigger, &group)
            && !any_trigger_match(&group, &batch)
        {
            debug!(
                folder = group.folder,
                batch = batch.len(),
                "no trigger match, messages accumulate in the store"
            );
            continue;
        }

        if let Err(err) = dispatch_window(router, &group).await {
            warn!(folder = group.folder, %err, "window dispatch failed");
        }
    }

    Ok(())
}

/// Hand the full catch-up window to the workspace: into a live run's stdin
/// when one is open, otherwise as a coalesced enqueue.
async fn dispatch_window(router: &Arc<Router>, group: &RegisteredGroup) -> Result<()> {
    let ctx = &router.ctx;
    let cursor = ctx.state.agent_cursor(&group.folder).await?;
    let pending = ctx
        .chats
        .messages_since(&group.jid, cursor, &ctx.config.assistant_name)
        .await?;
    let Some(last) = pending.last() else {
        return Ok(());
    };

    let prompt = format_messages(&pending);
    if ctx.queue.send_stdin(&group.folder, &prompt).await {
        // The live agent received the window; it is now handed off.
        ctx.state.set_agent_cursor(&group.folder, last.timestamp).await?;
        debug!(folder = group.folder, count = pending.len(), "window piped into live run");
    } else {
        ctx.queue
            .enqueue_check(&group.folder, Arc::clone(router) as Arc<dyn GroupRunner>);
    }
    Ok(())
}

/// Whether any message in the batch matches the group's trigger after
/// trimming. An invalid pattern admits everything rather than silencing
/// the group.
#[must_use]
pub fn any_trigger_match(group: &RegisteredGroup, batch: &[StoredMessage]) -> bool {
    let Some(ref pattern) = group.trigger else {
        return true;
    };
    let regex = match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => {
            warn!(folder = group.folder, pattern, %err, "invalid trigger pattern, admitting batch");
            return true;
        }
    };
    batch.iter().any(|msg| regex.is_match(msg.content.trim()))
}
