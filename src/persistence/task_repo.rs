//! Scheduled task and run-log repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::task::{ContextMode, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus};
use crate::Result;

use super::db::Database;
use super::{fmt_ts, parse_ts};

/// Repository for scheduled tasks and their run logs.
#[derive(Clone)]
pub struct TaskRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    group_folder: String,
    chat_jid: String,
    prompt: String,
    schedule_type: String,
    schedule_value: String,
    context_mode: String,
    next_run: Option<String>,
    last_run: Option<String>,
    last_result: Option<String>,
    status: String,
    created_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<ScheduledTask> {
        Ok(ScheduledTask {
            id: self.id,
            group_folder: self.group_folder,
            chat_jid: self.chat_jid,
            prompt: self.prompt,
            schedule_type: ScheduleType::parse(&self.schedule_type)?,
            schedule_value: self.schedule_value,
            context_mode: ContextMode::parse(&self.context_mode)?,
            next_run: self.next_run.as_deref().map(parse_ts).transpose()?,
            last_run: self.last_run.as_deref().map(parse_ts).transpose()?,
            last_result: self.last_result,
            status: TaskStatus::parse(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, \
                            context_mode, next_run, last_run, last_result, status, created_at";

impl TaskRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO scheduled_tasks
                (id, group_folder, chat_jid, prompt, schedule_type, schedule_value,
                 context_mode, next_run, last_run, last_result, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&task.id)
        .bind(&task.group_folder)
        .bind(&task.chat_jid)
        .bind(&task.prompt)
        .bind(task.schedule_type.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(task.next_run.map(fmt_ts))
        .bind(task.last_run.map(fmt_ts))
        .bind(&task.last_result)
        .bind(task.status.as_str())
        .bind(fmt_ts(task.created_at))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch one task by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1");
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// All tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<ScheduledTask>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at ASC");
        let rows: Vec<TaskRow> = sqlx::query_as(&sql).fetch_all(self.db.as_ref()).await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Tasks owned by one workspace, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_folder(&self, folder: &str) -> Result<Vec<ScheduledTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE group_folder = ?1 ORDER BY created_at ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(folder)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Active tasks whose `next_run` is at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
             ORDER BY next_run ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(fmt_ts(now))
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Change a task's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        sqlx::query("UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Replace a task's next fire time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_next_run(&self, id: &str, next_run: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1")
            .bind(id)
            .bind(next_run.map(fmt_ts))
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Remove a task.
    ///
    /// Returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?1")
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write back the outcome of one run: last-run bookkeeping plus the
    /// recomputed `next_run` and status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn finish_run(
        &self,
        id: &str,
        last_run: DateTime<Utc>,
        last_result: &str,
        next_run: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_tasks
             SET last_run = ?2, last_result = ?3, next_run = ?4, status = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(fmt_ts(last_run))
        .bind(last_result)
        .bind(next_run.map(fmt_ts))
        .bind(status.as_str())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Append a run log entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn log_run(&self, log: &TaskRunLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&log.task_id)
        .bind(fmt_ts(log.run_at))
        .bind(log.duration_ms)
        .bind(&log.status)
        .bind(&log.result)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Run logs for one task, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn run_logs(&self, task_id: &str) -> Result<Vec<TaskRunLog>> {
        #[derive(sqlx::FromRow)]
        struct LogRow {
            task_id: String,
            run_at: String,
            duration_ms: i64,
            status: String,
            result: Option<String>,
        }

        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT task_id, run_at, duration_ms, status, result
             FROM task_run_logs WHERE task_id = ?1 ORDER BY run_at DESC",
        )
        .bind(task_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(TaskRunLog {
                    task_id: row.task_id,
                    run_at: parse_ts(&row.run_at)?,
                    duration_ms: row.duration_ms,
                    status: row.status,
                    result: row.result,
                })
            })
            .collect()
    }

    /// Purge run logs older than `before`.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_run_logs(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_run_logs WHERE run_at < ?1")
            .bind(fmt_ts(before))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
