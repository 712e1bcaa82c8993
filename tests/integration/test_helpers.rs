//! Shared helpers for integration tests: in-memory store, recording
//! channel, shell-scripted fake agents, and seed utilities.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nanoclaw::channel::{Channel, ChannelSet, InboundMessage};
use nanoclaw::config::GlobalConfig;
use nanoclaw::models::chat::StoredMessage;
use nanoclaw::models::group::RegisteredGroup;
use nanoclaw::persistence::db;
use nanoclaw::persistence::SqlitePool;
use nanoclaw::router::Router;
use nanoclaw::Result;

/// Messages sent through the recording channel: `(chat_jid, text)`.
pub type SentLog = Arc<Mutex<Vec<(String, String)>>>;

/// Channel double that records outbound sends and owns `test:` jids.
pub struct RecordingChannel {
    pub sent: SentLog,
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "test"
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn listen(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send_message(&self, chat_jid: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .expect("sent lock")
            .push((chat_jid.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn set_typing(&self, _chat_jid: &str, _on: bool) -> Result<()> {
        Ok(())
    }

    async fn sync_metadata(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Test config: host engine, shell-scripted agent, background loops
/// parked on hour-long intervals so tests drive ticks by hand.
pub fn test_config(dir: &Path, agent_script: &str) -> GlobalConfig {
    let mut config = GlobalConfig::from_toml_str("").expect("defaults");
    config.data_dir = dir.join("data");
    config.workspaces_dir = dir.join("workspaces");
    config.container_runtime = "host".into();
    config.agent_command = Some(vec!["sh".into(), "-c".into(), agent_script.into()]);
    config.timing.poll_interval_ms = 3_600_000;
    config.timing.scheduler_interval_ms = 3_600_000;
    config.timing.ipc_interval_ms = 3_600_000;
    config.timing.idle_timeout_ms = 200;
    config.timing.container_timeout_ms = 10_000;
    config.retention_days = 0;
    config
}

/// Start a router over a fresh in-memory store.
pub async fn start_router(
    config: GlobalConfig,
) -> (Arc<Router>, SentLog, Arc<SqlitePool>, CancellationToken) {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let (router, sent, cancel) = start_router_with_db(config, Arc::clone(&pool)).await;
    (router, sent, pool, cancel)
}

/// Start a router over an existing pool (restart simulations).
pub async fn start_router_with_db(
    config: GlobalConfig,
    pool: Arc<SqlitePool>,
) -> (Arc<Router>, SentLog, CancellationToken) {
    let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
    let channels = ChannelSet::new(vec![Arc::new(RecordingChannel {
        sent: Arc::clone(&sent),
    }) as Arc<dyn Channel>]);
    let cancel = CancellationToken::new();
    let router = Router::start_with_db(Arc::new(config), channels, cancel.clone(), pool)
        .await
        .expect("router start");
    (router, sent, cancel)
}

/// Register a group directly through the repos, mirroring what
/// `register_group` IPC does.
pub async fn register_group(
    router: &Arc<Router>,
    jid: &str,
    folder: &str,
    trigger: Option<&str>,
    requires_trigger: bool,
) {
    let group = RegisteredGroup {
        jid: jid.to_owned(),
        name: folder.to_owned(),
        folder: folder.to_owned(),
        trigger: trigger.map(ToOwned::to_owned),
        requires_trigger,
        sandbox: None,
    };
    router.ctx.groups_repo.upsert(&group).await.expect("upsert group");
    router
        .ctx
        .ensure_workspace_dirs(folder)
        .expect("workspace dirs");
    router.ctx.install_group(group);
}

/// A deterministic timestamp `secs` seconds into the test epoch.
pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
        .single()
        .expect("base")
        + chrono::Duration::seconds(secs)
}

/// Seed one stored message (and its chat row).
pub async fn seed_message(
    router: &Arc<Router>,
    jid: &str,
    sender_name: &str,
    content: &str,
    timestamp: DateTime<Utc>,
) {
    router
        .ctx
        .chats
        .upsert_chat(jid, jid, timestamp)
        .await
        .expect("chat upsert");
    router
        .ctx
        .chats
        .insert_message(&StoredMessage {
            id: Uuid::new_v4().to_string(),
            chat_jid: jid.to_owned(),
            sender: sender_name.to_lowercase(),
            sender_name: sender_name.to_owned(),
            content: content.to_owned(),
            timestamp,
            from_self: false,
        })
        .await
        .expect("message insert");
}

/// Poll until `condition` holds or `timeout` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Fake agent: drain stdin (idle close releases it), then emit one
/// success frame.
pub fn ok_script(result: &str, new_session: Option<&str>) -> String {
    let session = new_session
        .map(|s| format!(",\"newSessionId\":\"{s}\""))
        .unwrap_or_default();
    format!(
        "cat >/dev/null; printf '%s\\n' '---NANOCLAW_OUTPUT_START---' \
         '{{\"status\":\"success\",\"result\":\"{result}\"{session}}}' \
         '---NANOCLAW_OUTPUT_END---'"
    )
}

/// Fake agent: record the stdin payload to `dump_path`, then emit frames.
pub fn dump_script(dump_path: &Path, result: &str, new_session: Option<&str>) -> String {
    let session = new_session
        .map(|s| format!(",\"newSessionId\":\"{s}\""))
        .unwrap_or_default();
    format!(
        "cat > '{}'; printf '%s\\n' '---NANOCLAW_OUTPUT_START---' \
         '{{\"status\":\"success\",\"result\":\"{result}\"{session}}}' \
         '---NANOCLAW_OUTPUT_END---'",
        dump_path.display()
    )
}

/// Fake agent: append a run marker to `marker_path` and fail.
pub fn fail_script(marker_path: &Path) -> String {
    format!(
        "cat >/dev/null; echo run >> '{}'; exit 3",
        marker_path.display()
    )
}

/// Count lines in the marker file written by [`fail_script`].
pub fn marker_runs(marker_path: &Path) -> usize {
    std::fs::read_to_string(marker_path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}
