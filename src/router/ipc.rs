//! Filesystem IPC dispatcher.
//!
//! Agents reach back into the host by dropping JSON files under their
//! workspace's `ipc/<folder>/{messages,tasks}/` directories. The poller
//! consumes them in name order (names carry a monotonic timestamp
//! prefix), derives the originating workspace from the directory path,
//! never from the payload, authorizes each request, applies the side
//! effect, and deletes the file. Anything that fails lands in the
//! workspace's `errors/` directory with an adjacent `.err` description.
//!
//! Between scans the dispatcher refreshes two read-only snapshots inside
//! each workspace: `tasks.json` and `groups.json`. Query-style requests
//! (`get_task`, `list_tasks`) are answered by those snapshots; consuming
//! the request file merely acknowledges it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::group::RegisteredGroup;
use crate::models::ipc::IpcRequest;
use crate::models::task::{ContextMode, ScheduleType, ScheduledTask, TaskStatus};
use crate::{AppError, Result};

use super::{scheduler, Router};

/// Which IPC subdirectory a file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IpcDir {
    Messages,
    Tasks,
}

impl IpcDir {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Tasks => "tasks",
        }
    }
}

/// Entry in the `groups.json` snapshot.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupSnapshotEntry {
    jid: String,
    name: String,
    is_registered: bool,
}

/// Spawn the IPC dispatcher.
#[must_use]
pub fn spawn(router: Arc<Router>) -> JoinHandle<()> {
    let cancel: CancellationToken = router.ctx.cancel.clone();
    let interval = Duration::from_millis(router.ctx.config.timing.ipc_interval_ms);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("ipc dispatcher shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            if let Err(err) = tick(&router).await {
                warn!(%err, "ipc sweep failed");
            }
        }
    })
}

/// One dispatcher sweep. Public for integration tests.
///
/// # Errors
///
/// Returns an error when the store is unreachable; per-file failures are
/// handled by the errors-directory protocol.
pub async fn tick(router: &Arc<Router>) -> Result<()> {
    for group in router.ctx.groups_snapshot() {
        router.ctx.ensure_workspace_dirs(&group.folder)?;

        for dir in [IpcDir::Messages, IpcDir::Tasks] {
            process_dir(router, &group, dir).await;
        }

        if let Err(err) = write_snapshots(router, &group).await {
            warn!(folder = group.folder, %err, "snapshot refresh failed");
        }
    }
    Ok(())
}

async fn process_dir(router: &Arc<Router>, group: &RegisteredGroup, dir: IpcDir) {
    let ipc_root = router.ctx.config.ipc_dir(&group.folder);
    let path = ipc_root.join(dir.dir_name());

    let mut files: Vec<PathBuf> = match fs::read_dir(&path) {
        Ok(entries) => entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(err) => {
            warn!(folder = group.folder, %err, "ipc dir unreadable");
            return;
        }
    };
    files.sort();

    for file in files {
        match handle_file(router, group, dir, &file).await {
            Ok(()) => {
                if let Err(err) = fs::remove_file(&file) {
                    warn!(path = %file.display(), %err, "processed ipc file not removed");
                }
            }
            Err(err) => {
                warn!(
                    folder = group.folder,
                    path = %file.display(),
                    %err,
                    "ipc request failed, moving to errors"
                );
                move_to_errors(&ipc_root, &file, &err);
            }
        }
    }
}

async fn handle_file(
    router: &Arc<Router>,
    group: &RegisteredGroup,
    dir: IpcDir,
    path: &Path,
) -> Result<()> {
    let text = fs::read_to_string(path)?;
    let request: IpcRequest = serde_json::from_str(&text)?;
    dispatch(router, group, dir, request).await
}

/// Authorization and side effects. `group` is the directory owner, the
/// trusted source identity for everything below.
async fn dispatch(
    router: &Arc<Router>,
    group: &RegisteredGroup,
    dir: IpcDir,
    request: IpcRequest,
) -> Result<()> {
    let ctx = &router.ctx;
    let privileged = ctx.config.is_main(&group.folder);

    match (dir, request) {
        (IpcDir::Messages, IpcRequest::Message { chat_jid, text }) => {
            if !privileged && chat_jid != group.jid {
                return Err(AppError::Unauthorized(format!(
                    "workspace {} may not message chat {chat_jid}",
                    group.folder
                )));
            }
            ctx.channels.send_message(&chat_jid, &text).await
        }

        (IpcDir::Tasks, IpcRequest::ScheduleTask {
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            group_folder,
            chat_jid,
        }) => {
            let target_folder = group_folder.unwrap_or_else(|| group.folder.clone());
            if !privileged && target_folder != group.folder {
                return Err(AppError::Unauthorized(format!(
                    "workspace {} may not schedule for {target_folder}",
                    group.folder
                )));
            }
            let target = ctx.group_by_folder(&target_folder).ok_or_else(|| {
                AppError::NotFound(format!("no workspace for folder {target_folder}"))
            })?;

            let target_chat = chat_jid.unwrap_or_else(|| target.jid.clone());
            if !privileged && target_chat != group.jid {
                return Err(AppError::Unauthorized(format!(
                    "workspace {} may not target chat {target_chat}",
                    group.folder
                )));
            }

            let schedule_type = ScheduleType::parse(&schedule_type)?;
            let context_mode = match context_mode.as_deref() {
                Some(mode) => ContextMode::parse(mode)?,
                None => ContextMode::default(),
            };
            let next_run =
                scheduler::compute_next_run(schedule_type, &schedule_value, Utc::now())?;

            let task = ScheduledTask::new(
                target_folder,
                target_chat,
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                next_run,
            );
            ctx.tasks.create(&task).await?;
            info!(
                task_id = task.id,
                folder = task.group_folder,
                schedule = task.schedule_type.as_str(),
                "task scheduled via ipc"
            );
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::PauseTask { task_id }) => {
            let task = authorized_task(router, group, privileged, &task_id).await?;
            ctx.tasks.set_status(&task.id, TaskStatus::Paused).await?;
            info!(task_id = task.id, "task paused via ipc");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::ResumeTask { task_id }) => {
            let task = authorized_task(router, group, privileged, &task_id).await?;
            // Recurring schedules restart from now; a one-shot keeps its
            // stored instant.
            if task.schedule_type != ScheduleType::Once {
                let next =
                    scheduler::compute_next_run(task.schedule_type, &task.schedule_value, Utc::now())?;
                ctx.tasks.set_next_run(&task.id, next).await?;
            }
            ctx.tasks.set_status(&task.id, TaskStatus::Active).await?;
            info!(task_id = task.id, "task resumed via ipc");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::CancelTask { task_id }) => {
            let task = authorized_task(router, group, privileged, &task_id).await?;
            ctx.tasks.delete(&task.id).await?;
            info!(task_id = task.id, "task cancelled via ipc");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::GetTask { task_id }) => {
            let task = authorized_task(router, group, privileged, &task_id).await?;
            debug!(task_id = task.id, "get_task acknowledged; answer is tasks.json");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::ListTasks) => {
            debug!(folder = group.folder, "list_tasks acknowledged; answer is tasks.json");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::RegisterGroup {
            jid,
            name,
            folder,
            trigger,
            requires_trigger,
            container_config,
        }) => {
            if !privileged {
                return Err(AppError::Unauthorized(format!(
                    "workspace {} may not register groups",
                    group.folder
                )));
            }
            if !RegisteredGroup::folder_is_safe(&folder) {
                return Err(AppError::Ipc(format!("unsafe folder name '{folder}'")));
            }
            if ctx.config.is_main(&folder) && ctx.group_by_folder(&folder).is_some() {
                return Err(AppError::Ipc(
                    "the privileged folder is already bound".into(),
                ));
            }

            let new_group = RegisteredGroup {
                jid: jid.clone(),
                name,
                folder: folder.clone(),
                trigger: trigger.or_else(|| ctx.config.default_trigger.clone()),
                requires_trigger: requires_trigger.unwrap_or(ctx.config.require_trigger),
                sandbox: container_config,
            };
            ctx.groups_repo.upsert(&new_group).await?;
            ctx.ensure_workspace_dirs(&folder)?;
            ctx.install_group(new_group);
            info!(jid, folder, "group registered via ipc");
            Ok(())
        }

        (IpcDir::Tasks, IpcRequest::RefreshGroups) => {
            if !privileged {
                return Err(AppError::Unauthorized(format!(
                    "workspace {} may not refresh groups",
                    group.folder
                )));
            }
            ctx.channels.sync_metadata(true).await;
            info!("channel metadata refresh requested via ipc");
            Ok(())
        }

        (dir, other) => Err(AppError::Ipc(format!(
            "request {other:?} not valid in {}/",
            dir.dir_name()
        ))),
    }
}

/// Fetch a task and check the caller may act on it.
async fn authorized_task(
    router: &Arc<Router>,
    group: &RegisteredGroup,
    privileged: bool,
    task_id: &str,
) -> Result<ScheduledTask> {
    let task = router
        .ctx
        .tasks
        .get(task_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no task {task_id}")))?;
    if !privileged && task.group_folder != group.folder {
        return Err(AppError::Unauthorized(format!(
            "workspace {} may not act on task {task_id} owned by {}",
            group.folder, task.group_folder
        )));
    }
    Ok(task)
}

/// Refresh `tasks.json` and `groups.json` inside a workspace's IPC root.
async fn write_snapshots(router: &Arc<Router>, group: &RegisteredGroup) -> Result<()> {
    let ctx = &router.ctx;
    let privileged = ctx.config.is_main(&group.folder);
    let ipc_root = ctx.config.ipc_dir(&group.folder);

    let tasks = if privileged {
        ctx.tasks.list().await?
    } else {
        ctx.tasks.list_for_folder(&group.folder).await?
    };
    write_json(&ipc_root.join("tasks.json"), &tasks)?;

    let registered = ctx.registered_jids();
    let entries: Vec<GroupSnapshotEntry> = ctx
        .chats
        .list_chats()
        .await?
        .into_iter()
        .filter(|chat| privileged || chat.jid == group.jid)
        .map(|chat| GroupSnapshotEntry {
            is_registered: registered.contains(&chat.jid),
            jid: chat.jid,
            name: chat.name,
        })
        .collect();
    write_json(&ipc_root.join("groups.json"), &entries)?;

    Ok(())
}

/// Write-then-rename so the agent never reads a half-written snapshot.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Ipc(format!("snapshot serialize: {err}")))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn move_to_errors(ipc_root: &Path, file: &Path, err: &AppError) {
    let errors_dir = ipc_root.join("errors");
    let Some(file_name) = file.file_name() else {
        return;
    };
    let dest = errors_dir.join(file_name);
    if let Err(move_err) = fs::rename(file, &dest) {
        warn!(path = %file.display(), %move_err, "failed to move ipc file to errors");
        // Last resort so the poller does not reprocess the file forever.
        let _ = fs::remove_file(file);
        return;
    }
    let err_path = dest.with_extension("err");
    if let Err(write_err) = fs::write(&err_path, format!("{err}\n")) {
        warn!(path = %err_path.display(), %write_err, "failed to write error sidecar");
    }
}
