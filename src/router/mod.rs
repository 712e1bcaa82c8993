//! Top-level wiring: startup, ingestion, recovery, run execution, shutdown.
//!
//! The router owns the in-memory copies of registered groups and hands
//! every mutation through the store first. It implements [`GroupRunner`],
//! so the group queue calls back into it for both message-window runs and
//! scheduler-injected task runs.

pub mod ipc;
pub mod message_loop;
pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::codec::{FrameStatus, OutputFrame};
use crate::agent::prompt::{format_messages, strip_internal, AgentInput};
use crate::agent::supervisor::{self, RunOutcome, SupervisorLimits};
use crate::channel::cli::CLI_CHAT_JID;
use crate::channel::{ChannelSet, InboundMessage};
use crate::config::GlobalConfig;
use crate::models::group::RegisteredGroup;
use crate::models::task::{ContextMode, ScheduledTask, TaskRunLog, TaskStatus};
use crate::mounts::MountPolicy;
use crate::persistence::chat_repo::ChatRepo;
use crate::persistence::db::{self, Database};
use crate::persistence::group_repo::GroupRepo;
use crate::persistence::session_repo::SessionRepo;
use crate::persistence::state_repo::StateRepo;
use crate::persistence::task_repo::TaskRepo;
use crate::persistence::{retention, SqlitePool};
use crate::queue::{GroupQueue, GroupRunner};
use crate::sandbox::runtime::RuntimeSelector;
use crate::sandbox::{load_credential_env, EngineSet, ExecutionRequest};
use crate::{AppError, Result};

/// Shared application state, threaded through every subsystem.
pub struct RouterCtx {
    pub config: Arc<GlobalConfig>,
    pub db: Arc<Database>,
    pub chats: ChatRepo,
    pub groups_repo: GroupRepo,
    pub sessions: SessionRepo,
    pub tasks: TaskRepo,
    pub state: StateRepo,
    /// In-memory copy of registrations; refreshed from the store on every
    /// mutation.
    pub groups: RwLock<HashMap<String, RegisteredGroup>>,
    pub channels: ChannelSet,
    pub queue: Arc<GroupQueue>,
    pub engines: EngineSet,
    pub selector: RuntimeSelector,
    pub cancel: CancellationToken,
}

impl RouterCtx {
    /// Snapshot of every registration.
    #[must_use]
    pub fn groups_snapshot(&self) -> Vec<RegisteredGroup> {
        read_lock(&self.groups).values().cloned().collect()
    }

    /// Registered chat jids.
    #[must_use]
    pub fn registered_jids(&self) -> Vec<String> {
        read_lock(&self.groups).keys().cloned().collect()
    }

    /// Look up a registration by chat jid.
    #[must_use]
    pub fn group_by_jid(&self, jid: &str) -> Option<RegisteredGroup> {
        read_lock(&self.groups).get(jid).cloned()
    }

    /// Look up a registration by workspace folder.
    #[must_use]
    pub fn group_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        read_lock(&self.groups)
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    /// Install a registration in the in-memory copy (the store write has
    /// already happened).
    pub fn install_group(&self, group: RegisteredGroup) {
        self.groups
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(group.jid.clone(), group);
    }

    /// Create the on-disk directories a workspace needs.
    pub fn ensure_workspace_dirs(&self, folder: &str) -> Result<()> {
        fs::create_dir_all(self.config.workspace_dir(folder))?;
        fs::create_dir_all(self.config.sessions_dir(folder))?;
        let ipc = self.config.ipc_dir(folder);
        for sub in ["messages", "tasks", "errors"] {
            fs::create_dir_all(ipc.join(sub))?;
        }
        Ok(())
    }
}

fn read_lock(
    lock: &RwLock<HashMap<String, RegisteredGroup>>,
) -> std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredGroup>> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Parameters for one agent run.
struct RunParams<'a> {
    group: &'a RegisteredGroup,
    input: AgentInput,
    reply_jid: &'a str,
    persist_session: bool,
    /// Cursor value re-persisted after every frame for mid-run crash
    /// safety; `None` for task runs.
    persist_cursor: Option<DateTime<Utc>>,
}

/// The router: top-level orchestration object.
pub struct Router {
    pub ctx: Arc<RouterCtx>,
    /// Task ids currently queued or running, so a slow run is not enqueued
    /// again by the next sweep.
    inflight_tasks: StdMutex<HashSet<String>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Build the full application, perform startup recovery, and spawn all
    /// background loops.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or startup state
    /// cannot be loaded.
    pub async fn start(
        config: Arc<GlobalConfig>,
        channels: ChannelSet,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let db = Arc::new(db::connect(&config.store_path()).await?);
        Self::start_with_db(config, channels, cancel, db).await
    }

    /// [`Router::start`] against an existing pool; tests use the in-memory
    /// store through this entry point.
    ///
    /// # Errors
    ///
    /// Returns an error when startup state cannot be loaded.
    pub async fn start_with_db(
        config: Arc<GlobalConfig>,
        channels: ChannelSet,
        cancel: CancellationToken,
        db: Arc<SqlitePool>,
    ) -> Result<Arc<Self>> {
        let chats = ChatRepo::new(Arc::clone(&db));
        let groups_repo = GroupRepo::new(Arc::clone(&db));
        let sessions = SessionRepo::new(Arc::clone(&db));
        let tasks = TaskRepo::new(Arc::clone(&db));
        let state = StateRepo::new(Arc::clone(&db));

        let mut groups = groups_repo.all().await?;
        info!(count = groups.len(), "registered groups loaded");

        // A terminal-only deployment gets the privileged workspace bound
        // to the terminal chat automatically.
        if config.cli_channel && !groups.values().any(|g| config.is_main(&g.folder)) {
            let main = RegisteredGroup {
                jid: CLI_CHAT_JID.to_owned(),
                name: "terminal".to_owned(),
                folder: config.main_folder.clone(),
                trigger: None,
                requires_trigger: false,
                sandbox: None,
            };
            groups_repo.upsert(&main).await?;
            groups.insert(main.jid.clone(), main);
            info!(folder = config.main_folder, "terminal chat bound to privileged workspace");
        }

        let engines = EngineSet::standard(config.data_dir.join("vibe-images").join("base.raw"));
        let selector = RuntimeSelector::new(
            Arc::clone(&config),
            StateRepo::new(Arc::clone(&db)),
            engines.clone(),
        );
        let queue = Arc::new(GroupQueue::new(cancel.clone()));

        let ctx = Arc::new(RouterCtx {
            config,
            db,
            chats,
            groups_repo,
            sessions,
            tasks,
            state,
            groups: RwLock::new(groups),
            channels,
            queue,
            engines,
            selector,
            cancel,
        });

        for group in ctx.groups_snapshot() {
            ctx.ensure_workspace_dirs(&group.folder)?;
        }
        fs::create_dir_all(ctx.config.global_workspace_dir())?;

        let router = Arc::new(Self {
            ctx: Arc::clone(&ctx),
            inflight_tasks: StdMutex::new(HashSet::new()),
            handles: StdMutex::new(Vec::new()),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        ctx.channels.start(inbound_tx).await;

        router.recover().await?;

        let mut handles = Vec::new();
        handles.push(spawn_ingestion(Arc::clone(&router), inbound_rx));
        handles.push(message_loop::spawn(Arc::clone(&router)));
        handles.push(scheduler::spawn(Arc::clone(&router)));
        handles.push(ipc::spawn(Arc::clone(&router)));
        if ctx.config.retention_days > 0 {
            handles.push(retention::spawn_retention_task(
                ctx.chats.clone(),
                ctx.tasks.clone(),
                ctx.config.retention_days,
                ctx.cancel.clone(),
            ));
        }
        *router
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = handles;

        info!("router started");
        Ok(router)
    }

    /// Re-enqueue any workspace whose catch-up window is non-empty. This
    /// is what makes a crash between the store-wide watermark persist and
    /// a group's run recoverable.
    async fn recover(self: &Arc<Self>) -> Result<()> {
        let self_name = self.ctx.config.assistant_name.clone();
        let require_trigger = effective_require_trigger(&self.ctx).await;
        for group in self.ctx.groups_snapshot() {
            let cursor = self.ctx.state.agent_cursor(&group.folder).await?;
            let pending = self
                .ctx
                .chats
                .messages_since(&group.jid, cursor, &self_name)
                .await?;
            if pending.is_empty() {
                continue;
            }
            if group_requires_trigger(&self.ctx.config, require_trigger, &group)
                && !message_loop::any_trigger_match(&group, &pending)
            {
                continue;
            }
            info!(
                folder = group.folder,
                pending = pending.len(),
                "recovery: re-enqueueing unprocessed window"
            );
            self.ctx
                .queue
                .enqueue_check(&group.folder, Arc::clone(self) as Arc<dyn GroupRunner>);
        }
        Ok(())
    }

    /// Graceful shutdown: the cancellation token has already fired; drain
    /// the queue within the grace window, then disconnect channels.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.ctx.config.shutdown_grace_secs);
        self.ctx.queue.shutdown(grace).await;
        self.ctx.channels.disconnect().await;

        let handles = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for handle in handles {
            let _ = handle.await;
        }
        info!("router stopped");
    }

    /// Execute one agent run, streaming frames into session/cursor/channel
    /// side effects. Returns the outcome and the surfaced result texts.
    async fn execute(&self, params: RunParams<'_>) -> Result<(RunOutcome, Vec<String>)> {
        let ctx = &self.ctx;
        let group = params.group;
        let folder = group.folder.clone();
        let privileged = ctx.config.is_main(&folder);

        let (engine_kind, agent_cli) = ctx.selector.select(group).await?;
        let engine = ctx.engines.get(engine_kind)?;

        // Policy and mounts are re-read per run; a rejection refuses the
        // run before anything is spawned.
        let policy = MountPolicy::load(&ctx.config.mount_policy_path())?;
        let requested = group
            .sandbox
            .as_ref()
            .map(|s| s.mounts.clone())
            .unwrap_or_default();
        let mounts = policy.validate_all(&requested, privileged)?;

        ctx.ensure_workspace_dirs(&folder)?;

        let request = ExecutionRequest {
            folder: folder.clone(),
            chat_jid: group.jid.clone(),
            privileged,
            agent_cli,
            agent_command: ctx.config.agent_command.clone(),
            mounts,
            env: load_credential_env(ctx.config.env_file.as_deref()),
            timeout: run_timeout(&ctx.config, group),
            cpus: group.sandbox.as_ref().and_then(|s| s.cpus),
            memory_mb: group.sandbox.as_ref().and_then(|s| s.memory_mb),
            image: group
                .sandbox
                .as_ref()
                .and_then(|s| s.image.clone())
                .or_else(|| Some(ctx.config.container_image.clone())),
            workspace_dir: ctx.config.workspace_dir(&folder),
            sessions_dir: ctx.config.sessions_dir(&folder),
            ipc_dir: ctx.config.ipc_dir(&folder),
            global_dir: ctx.config.global_workspace_dir(),
            project_root: project_root(),
            vm_image: ctx.config.vm_image_path(&folder),
        };
        let limits = SupervisorLimits {
            timeout: request.timeout,
            idle_timeout: Duration::from_millis(ctx.config.timing.idle_timeout_ms),
            max_output_bytes: ctx.config.timing.max_output_bytes,
        };

        let (frame_tx, mut frame_rx) = mpsc::channel::<OutputFrame>(16);
        let run = supervisor::run_agent(
            engine.as_ref(),
            &request,
            &params.input,
            limits,
            ctx.queue.live(),
            frame_tx,
            ctx.cancel.clone(),
        );

        let drain = async {
            let mut texts = Vec::new();
            while let Some(frame) = frame_rx.recv().await {
                self.apply_frame(&params, &frame, &mut texts).await;
            }
            texts
        };

        let (outcome, texts) = tokio::join!(run, drain);
        Ok((outcome, texts))
    }

    /// Side effects of one frame, in the order that makes a crash safe:
    /// session first, then the reply, then the cursor re-persist.
    async fn apply_frame(&self, params: &RunParams<'_>, frame: &OutputFrame, texts: &mut Vec<String>) {
        let ctx = &self.ctx;
        let folder = &params.group.folder;

        if let Some(ref session_id) = frame.new_session_id {
            if params.persist_session {
                if let Err(err) = ctx.sessions.set(folder, session_id).await {
                    warn!(folder, %err, "session persist failed");
                }
            }
        }

        match frame.status {
            FrameStatus::Success => {
                if let Some(ref result) = frame.result {
                    let text = strip_internal(result);
                    if !text.is_empty() {
                        if let Err(err) = ctx.channels.send_message(params.reply_jid, &text).await
                        {
                            tracing::error!(folder, %err, "reply delivery failed");
                        }
                        texts.push(text);
                    }
                }
            }
            FrameStatus::Error => {
                warn!(
                    folder,
                    error = frame.error.as_deref().unwrap_or("unspecified"),
                    "agent reported error frame"
                );
            }
        }

        if let Some(cursor) = params.persist_cursor {
            if let Err(err) = ctx.state.set_agent_cursor(folder, cursor).await {
                warn!(folder, %err, "cursor persist failed");
            }
        }
    }

    async fn process_group(&self, folder: &str) -> Result<()> {
        let ctx = &self.ctx;
        let group = ctx
            .group_by_folder(folder)
            .ok_or_else(|| AppError::NotFound(format!("no workspace for folder {folder}")))?;

        let previous = ctx.state.agent_cursor(folder).await?;
        let pending = ctx
            .chats
            .messages_since(&group.jid, previous, &ctx.config.assistant_name)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let Some(last) = pending.last() else {
            return Ok(());
        };
        let advanced = last.timestamp;

        // Advance before the spawn so the message loop does not re-pipe
        // this window into the live run; rolled back below on failure.
        ctx.state.set_agent_cursor(folder, advanced).await?;

        let input = AgentInput {
            prompt: format_messages(&pending),
            session_id: ctx.sessions.get(folder).await?,
            group_folder: folder.to_owned(),
            chat_jid: group.jid.clone(),
            is_main: ctx.config.is_main(folder),
            is_scheduled_task: false,
        };

        ctx.channels.set_typing(&group.jid, true).await;
        let result = self
            .execute(RunParams {
                group: &group,
                input,
                reply_jid: &group.jid,
                persist_session: true,
                persist_cursor: Some(advanced),
            })
            .await;
        ctx.channels.set_typing(&group.jid, false).await;

        match result {
            Ok((RunOutcome::Success, _)) => Ok(()),
            Ok((RunOutcome::Failure(reason), _)) => {
                warn!(folder, reason, "run failed, rolling back cursor for retry");
                ctx.state.set_agent_cursor(folder, previous).await?;
                Ok(())
            }
            Err(err) => {
                warn!(folder, %err, "run refused, rolling back cursor for retry");
                ctx.state.set_agent_cursor(folder, previous).await?;
                Ok(())
            }
        }
    }

    async fn process_task(&self, task: &ScheduledTask) -> Result<(RunOutcome, Vec<String>)> {
        let ctx = &self.ctx;
        let group = ctx.group_by_folder(&task.group_folder).ok_or_else(|| {
            AppError::NotFound(format!("no workspace for folder {}", task.group_folder))
        })?;

        let session_id = match task.context_mode {
            ContextMode::Group => ctx.sessions.get(&task.group_folder).await?,
            ContextMode::Isolated => None,
        };

        let input = AgentInput {
            prompt: format!("Execute scheduled task: {}", task.prompt),
            session_id,
            group_folder: task.group_folder.clone(),
            chat_jid: task.chat_jid.clone(),
            is_main: ctx.config.is_main(&task.group_folder),
            is_scheduled_task: true,
        };

        self.execute(RunParams {
            group: &group,
            input,
            reply_jid: &task.chat_jid,
            persist_session: task.context_mode == ContextMode::Group,
            persist_cursor: None,
        })
        .await
    }

    /// Returns false when the task is already queued or running.
    pub(crate) fn mark_task_inflight(&self, id: &str) -> bool {
        self.inflight_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(id.to_owned())
    }

    fn clear_task_inflight(&self, id: &str) {
        self.inflight_tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(id);
    }
}

#[async_trait]
impl GroupRunner for Router {
    async fn run_check(&self, folder: &str) {
        if let Err(err) = self.process_group(folder).await {
            warn!(folder, %err, "group run errored");
        }
    }

    async fn run_task(&self, task: ScheduledTask) {
        let started = std::time::Instant::now();
        let run_at = Utc::now();

        let result = self.process_task(&task).await;
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let (status, summary) = match &result {
            Ok((RunOutcome::Success, texts)) => (
                "success",
                texts.last().cloned().unwrap_or_else(|| "completed".into()),
            ),
            Ok((RunOutcome::Failure(reason), _)) => ("error", reason.clone()),
            Err(err) => ("error", err.to_string()),
        };

        if let Err(err) = self
            .ctx
            .tasks
            .log_run(&TaskRunLog {
                task_id: task.id.clone(),
                run_at,
                duration_ms,
                status: status.to_owned(),
                result: Some(summary.clone()),
            })
            .await
        {
            warn!(task_id = task.id, %err, "run log write failed");
        }

        self.write_back_task(&task, run_at, &summary).await;
        self.clear_task_inflight(&task.id);
    }
}

impl Router {
    /// Post-run task bookkeeping. A task deleted or cancelled mid-run
    /// keeps its run log but gets no result write-back.
    async fn write_back_task(&self, task: &ScheduledTask, run_at: DateTime<Utc>, summary: &str) {
        let current = match self.ctx.tasks.get(&task.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(task_id = task.id, "task deleted mid-run, dropping result update");
                return;
            }
            Err(err) => {
                warn!(task_id = task.id, %err, "task refetch failed");
                return;
            }
        };

        let (next_run, status) = match task.schedule_type {
            crate::models::task::ScheduleType::Once => (None, TaskStatus::Completed),
            _ => match scheduler::compute_next_run(
                task.schedule_type,
                &task.schedule_value,
                Utc::now(),
            ) {
                Ok(next) => (next, current.status),
                Err(err) => {
                    warn!(task_id = task.id, %err, "schedule recomputation failed, pausing task");
                    if let Err(err) = self
                        .ctx
                        .tasks
                        .finish_run(&task.id, run_at, &err.to_string(), None, TaskStatus::Paused)
                        .await
                    {
                        warn!(task_id = task.id, %err, "task write-back failed");
                    }
                    return;
                }
            },
        };

        if let Err(err) = self
            .ctx
            .tasks
            .finish_run(&task.id, run_at, summary, next_run, status)
            .await
        {
            warn!(task_id = task.id, %err, "task write-back failed");
        }
    }
}

/// Whether the trigger gate applies to a group. `require_trigger` is the
/// effective global switch (settings row over config default).
#[must_use]
pub fn group_requires_trigger(
    config: &GlobalConfig,
    require_trigger: bool,
    group: &RegisteredGroup,
) -> bool {
    !config.is_main(&group.folder)
        && require_trigger
        && group.requires_trigger
        && group.trigger.is_some()
}

/// Resolve the global trigger switch: settings row, then config default.
pub async fn effective_require_trigger(ctx: &RouterCtx) -> bool {
    match ctx.state.get_setting(crate::config::keys::REQUIRE_TRIGGER).await {
        Ok(Some(value)) => value == "true",
        Ok(None) => ctx.config.require_trigger,
        Err(err) => {
            warn!(%err, "require_trigger setting unreadable, using config default");
            ctx.config.require_trigger
        }
    }
}

fn run_timeout(config: &GlobalConfig, group: &RegisteredGroup) -> Duration {
    let ms = group
        .sandbox
        .as_ref()
        .and_then(|s| s.timeout_ms)
        .unwrap_or(config.timing.container_timeout_ms);
    Duration::from_millis(ms)
}

fn project_root() -> std::path::PathBuf {
    std::env::current_dir().unwrap_or_else(|_| std::path::PathBuf::from("."))
}

fn spawn_ingestion(
    router: Arc<Router>,
    mut rx: mpsc::Receiver<InboundMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ctx = Arc::clone(&router.ctx);
        loop {
            let msg = tokio::select! {
                () = ctx.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let chat_name = msg.chat_name.clone().unwrap_or_else(|| msg.chat_jid.clone());
            if let Err(err) = ctx
                .chats
                .upsert_chat(&msg.chat_jid, &chat_name, msg.timestamp)
                .await
            {
                warn!(chat_jid = msg.chat_jid, %err, "chat upsert failed");
                continue;
            }

            // Content is only kept for chats bound to a workspace.
            if ctx.group_by_jid(&msg.chat_jid).is_some() {
                if let Err(err) = ctx.chats.insert_message(&msg.clone().into()).await {
                    warn!(chat_jid = msg.chat_jid, %err, "message insert failed");
                }
            }
        }
        debug!("ingestion loop stopped");
    })
}
