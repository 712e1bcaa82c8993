//! Persistence layer modules.

pub mod chat_repo;
pub mod db;
pub mod group_repo;
pub mod retention;
pub mod schema;
pub mod session_repo;
pub mod state_repo;
pub mod task_repo;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Canonical timestamp text form stored in the database.
///
/// Millisecond precision with a trailing `Z` so lexicographic `TEXT`
/// comparison in SQL equals chronological comparison.
#[must_use]
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp back into UTC.
///
/// # Errors
///
/// Returns `AppError::Db` for text that is not valid RFC 3339.
pub fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid timestamp '{text}': {err}")))
}
