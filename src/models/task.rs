//! Scheduled task and run-log models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, Result};

/// How `schedule_value` is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// 5-field cron expression.
    Cron,
    /// Fixed interval in milliseconds.
    Interval,
    /// Single ISO-8601 fire time.
    Once,
}

impl ScheduleType {
    /// Stable string form used in the store and on the IPC wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Schedule` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => Err(AppError::Schedule(format!("unknown schedule type: {other}"))),
        }
    }
}

/// Which session a scheduled run is given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Reuse and update the workspace's current session.
    #[default]
    Group,
    /// Run without a session; the result never touches the group session.
    Isolated,
}

impl ContextMode {
    /// Stable string form used in the store and on the IPC wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Isolated => "isolated",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Schedule` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "group" => Ok(Self::Group),
            "isolated" => Ok(Self::Isolated),
            other => Err(AppError::Schedule(format!("unknown context mode: {other}"))),
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Eligible to fire when `next_run` passes.
    Active,
    /// Never eligible until resumed.
    Paused,
    /// Terminal; `once` tasks land here after their single run.
    Completed,
}

impl TaskStatus {
    /// Stable string form used in the store.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Schedule` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            other => Err(AppError::Schedule(format!("unknown task status: {other}"))),
        }
    }
}

/// A recurring or one-shot agent invocation bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ScheduledTask {
    /// Unique identifier.
    pub id: String,
    /// Owning workspace folder.
    pub group_folder: String,
    /// Chat the run's replies are delivered to.
    pub chat_jid: String,
    /// Prompt text handed to the agent.
    pub prompt: String,
    /// Schedule kind.
    pub schedule_type: ScheduleType,
    /// Cron expression, interval milliseconds, or ISO timestamp.
    pub schedule_value: String,
    /// Session handling for runs.
    pub context_mode: ContextMode,
    /// Next eligible fire time; `None` for completed tasks.
    pub next_run: Option<DateTime<Utc>>,
    /// When the task last ran.
    pub last_run: Option<DateTime<Utc>>,
    /// Outcome summary or error from the last run.
    pub last_result: Option<String>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Construct a new active task with a generated identifier.
    #[must_use]
    pub fn new(
        group_folder: String,
        chat_jid: String,
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        context_mode: ContextMode,
        next_run: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_folder,
            chat_jid,
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            next_run,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: Utc::now(),
        }
    }
}

/// Append-only record of one task execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskRunLog {
    /// Task that ran.
    pub task_id: String,
    /// Run start time.
    pub run_at: DateTime<Utc>,
    /// Wall-clock duration.
    pub duration_ms: i64,
    /// `success` or `error`.
    pub status: String,
    /// Result text or error description.
    pub result: Option<String>,
}
