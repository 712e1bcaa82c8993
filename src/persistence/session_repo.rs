//! Session handle repository.

use std::sync::Arc;

use crate::Result;

use super::db::Database;

/// Repository for per-workspace session handles.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Current session for a workspace, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, folder: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_id FROM sessions WHERE folder = ?1")
                .bind(folder)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Record the latest session handle for a workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the upsert fails.
    pub async fn set(&self, folder: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (folder, session_id) VALUES (?1, ?2)
             ON CONFLICT(folder) DO UPDATE SET session_id = excluded.session_id",
        )
        .bind(folder)
        .bind(session_id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}
