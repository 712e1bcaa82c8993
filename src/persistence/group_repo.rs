//! Registered group repository.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::group::{RegisteredGroup, SandboxConfig};
use crate::{AppError, Result};

use super::db::Database;

/// Repository for workspace registrations.
#[derive(Clone)]
pub struct GroupRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    jid: String,
    name: String,
    folder: String,
    trigger_pattern: Option<String>,
    requires_trigger: i64,
    container_config: Option<String>,
}

impl GroupRow {
    fn into_group(self) -> Result<RegisteredGroup> {
        // Corrupt sandbox JSON degrades to defaults rather than wedging the
        // whole group list.
        let sandbox: Option<SandboxConfig> = match self.container_config.as_deref() {
            None | Some("") => None,
            Some(text) => match serde_json::from_str(text) {
                Ok(cfg) => Some(cfg),
                Err(err) => {
                    tracing::warn!(folder = %self.folder, %err,
                        "resetting corrupt sandbox config");
                    None
                }
            },
        };

        Ok(RegisteredGroup {
            jid: self.jid,
            name: self.name,
            folder: self.folder,
            trigger: self.trigger_pattern,
            requires_trigger: self.requires_trigger != 0,
            sandbox,
        })
    }
}

const GROUP_COLUMNS: &str =
    "jid, name, folder, trigger_pattern, requires_trigger, container_config";

impl GroupRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update a registration. The folder stays bound to its jid;
    /// re-registering an existing jid overwrites its settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on conflict with another group's folder or on
    /// persistence failure.
    pub async fn upsert(&self, group: &RegisteredGroup) -> Result<()> {
        let config_json = group
            .sandbox
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|err| AppError::Db(format!("sandbox config serialize: {err}")))?;

        sqlx::query(
            "INSERT INTO registered_groups
                (jid, name, folder, trigger_pattern, requires_trigger, container_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(jid) DO UPDATE SET
                name = excluded.name,
                folder = excluded.folder,
                trigger_pattern = excluded.trigger_pattern,
                requires_trigger = excluded.requires_trigger,
                container_config = excluded.container_config",
        )
        .bind(&group.jid)
        .bind(&group.name)
        .bind(&group.folder)
        .bind(&group.trigger)
        .bind(i64::from(group.requires_trigger))
        .bind(config_json)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// All registrations keyed by chat jid.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn all(&self) -> Result<HashMap<String, RegisteredGroup>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM registered_groups");
        let rows: Vec<GroupRow> = sqlx::query_as(&sql).fetch_all(self.db.as_ref()).await?;

        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            let group = row.into_group()?;
            map.insert(group.jid.clone(), group);
        }
        Ok(map)
    }

    /// Look up a registration by workspace folder.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        let sql = format!("SELECT {GROUP_COLUMNS} FROM registered_groups WHERE folder = ?1");
        let row: Option<GroupRow> = sqlx::query_as(&sql)
            .bind(folder)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(GroupRow::into_group).transpose()
    }
}
