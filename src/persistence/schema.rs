//! Schema definitions and bootstrap logic.
//!
//! Tables are created with `IF NOT EXISTS` so re-execution is safe across
//! restarts. Columns added after first release are applied by an upgrade
//! pass that attempts `ALTER TABLE … ADD COLUMN` and treats a duplicate
//! column failure as already-applied.

use sqlx::SqlitePool;
use tracing::debug;

use crate::Result;

/// Statements creating the baseline tables and required indexes.
const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS chats (
        jid TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        last_message_time TEXT
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT NOT NULL,
        chat_jid TEXT NOT NULL,
        sender TEXT NOT NULL,
        sender_name TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (chat_jid, id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_time
        ON messages (chat_jid, timestamp)",
    "CREATE TABLE IF NOT EXISTS registered_groups (
        jid TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        folder TEXT NOT NULL UNIQUE,
        trigger_pattern TEXT,
        requires_trigger INTEGER NOT NULL DEFAULT 1,
        container_config TEXT
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        folder TEXT PRIMARY KEY,
        session_id TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        group_folder TEXT NOT NULL,
        chat_jid TEXT NOT NULL,
        prompt TEXT NOT NULL,
        schedule_type TEXT NOT NULL,
        schedule_value TEXT NOT NULL,
        next_run TEXT,
        last_run TEXT,
        last_result TEXT,
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_next_run
        ON scheduled_tasks (status, next_run)",
    "CREATE TABLE IF NOT EXISTS task_run_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id TEXT NOT NULL,
        run_at TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        status TEXT NOT NULL,
        result TEXT
    )",
    "CREATE TABLE IF NOT EXISTS router_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Columns added after the baseline schema. Each entry is attempted on
/// every startup; "duplicate column name" means already present.
const UPGRADES: &[&str] = &[
    "ALTER TABLE messages ADD COLUMN from_self INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE scheduled_tasks ADD COLUMN context_mode TEXT NOT NULL DEFAULT 'group'",
];

/// Apply all table definitions and column upgrades.
///
/// # Errors
///
/// Returns `AppError::Db` if any baseline statement fails.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in DDL {
        sqlx::query(stmt).execute(pool).await?;
    }

    for stmt in UPGRADES {
        if let Err(err) = sqlx::query(stmt).execute(pool).await {
            let text = err.to_string();
            if text.contains("duplicate column name") {
                debug!(statement = *stmt, "column already present, skipping upgrade");
            } else {
                return Err(err.into());
            }
        }
    }

    Ok(())
}
