//! Scheduler: periodic sweep of due tasks.
//!
//! Due tasks are injected through the group queue, so a scheduled run and
//! a live conversation for the same workspace serialize instead of racing.
//! Next-fire computation lives here too: cron strictly-after-now, interval
//! as now-plus-milliseconds, one-shot as the stored instant.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::task::ScheduleType;
use crate::persistence::parse_ts;
use crate::queue::GroupRunner;
use crate::{AppError, Result};

use super::Router;

/// Spawn the scheduler sweep.
#[must_use]
pub fn spawn(router: Arc<Router>) -> JoinHandle<()> {
    let cancel: CancellationToken = router.ctx.cancel.clone();
    let interval = Duration::from_millis(router.ctx.config.timing.scheduler_interval_ms);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("scheduler shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = tick(&router).await {
                warn!(%err, "scheduler sweep failed");
            }
        }
    })
}

/// One sweep. Public for integration tests.
///
/// # Errors
///
/// Returns an error when the store is unreachable.
pub async fn tick(router: &Arc<Router>) -> Result<()> {
    let ctx = &router.ctx;
    let due = ctx.tasks.due(Utc::now()).await?;

    for task in due {
        if ctx.group_by_folder(&task.group_folder).is_none() {
            warn!(
                task_id = task.id,
                folder = task.group_folder,
                "task references unknown workspace, skipping"
            );
            continue;
        }
        // A run slower than the sweep interval must not be enqueued twice.
        if !router.mark_task_inflight(&task.id) {
            continue;
        }
        debug!(task_id = task.id, folder = task.group_folder, "task due, enqueueing");
        ctx.queue
            .enqueue_task(task, Arc::clone(router) as Arc<dyn GroupRunner>);
    }

    Ok(())
}

/// Compute the next fire time for a schedule.
///
/// - `cron`: the least matching instant strictly after `now`.
/// - `interval`: `now` plus the value in milliseconds (must be positive).
/// - `once`: the stored ISO instant, which may be in the past (fires on
///   the next sweep).
///
/// # Errors
///
/// Returns `AppError::Schedule` for unparseable expressions, non-positive
/// intervals, or cron expressions with no upcoming fire time.
pub fn compute_next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Cron => {
            let normalized = normalize_cron(value)?;
            let schedule = Schedule::from_str(&normalized)
                .map_err(|err| AppError::Schedule(format!("invalid cron '{value}': {err}")))?;
            let next = schedule
                .after(&now)
                .next()
                .ok_or_else(|| AppError::Schedule(format!("cron '{value}' has no upcoming fire time")))?;
            Ok(Some(next))
        }
        ScheduleType::Interval => {
            let ms: i64 = value
                .trim()
                .parse()
                .map_err(|_| AppError::Schedule(format!("invalid interval '{value}'")))?;
            if ms <= 0 {
                return Err(AppError::Schedule(format!(
                    "interval must be positive, got {ms}"
                )));
            }
            Ok(Some(now + chrono::Duration::milliseconds(ms)))
        }
        ScheduleType::Once => {
            let at = parse_ts(value.trim())
                .map_err(|_| AppError::Schedule(format!("invalid timestamp '{value}'")))?;
            Ok(Some(at))
        }
    }
}

/// The store carries standard 5-field crontab expressions; the parser is
/// Quartz-style (leading seconds field, Sunday-first numeric weekdays).
/// A seconds field is prefixed and numeric weekdays are rewritten to
/// names, which mean the same thing in both dialects. 6- and 7-field
/// expressions pass through untouched.
fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = map_dow_field(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {dow}",
                fields[0], fields[1], fields[2], fields[3]
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(AppError::Schedule(format!(
            "cron expression must have 5 fields, got {n}"
        ))),
    }
}

const DOW_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn map_dow_field(field: &str) -> Result<String> {
    let parts: Vec<String> = field
        .split(',')
        .map(map_dow_part)
        .collect::<Result<_>>()?;
    Ok(parts.join(","))
}

fn map_dow_part(part: &str) -> Result<String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    };

    let mapped = if range == "*" {
        "*".to_owned()
    } else if let Some((from, to)) = range.split_once('-') {
        format!("{}-{}", map_dow_token(from)?, map_dow_token(to)?)
    } else {
        map_dow_token(range)?
    };

    Ok(match step {
        Some(step) => format!("{mapped}/{step}"),
        None => mapped,
    })
}

/// Crontab numbers weekdays 0-7 with both 0 and 7 meaning Sunday.
fn map_dow_token(token: &str) -> Result<String> {
    match token.parse::<usize>() {
        Ok(n) if n <= 7 => Ok(DOW_NAMES[n % 7].to_owned()),
        Ok(n) => Err(AppError::Schedule(format!("invalid day of week '{n}'"))),
        // Already a name; the parser validates it.
        Err(_) => Ok(token.to_owned()),
    }
}
