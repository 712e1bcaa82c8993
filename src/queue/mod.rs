//! Per-workspace serialized execution queue.
//!
//! One worker per folder, at most one agent child process per folder at
//! any time. Message-loop trigger signals coalesce through a work-pending
//! flag: any number of enqueues between the start of one run and the start
//! of the next produce exactly one subsequent run. Scheduler-injected task
//! runs queue FIFO behind the same worker, so they serialize with live
//! conversations.
//!
//! The live-process registry publishes each run's open stdin; the message
//! loop writes follow-up envelopes through it while the run lasts, and the
//! idle/shutdown paths half-close it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::models::task::ScheduledTask;

/// Work a group worker can pick up.
enum Job {
    /// Process the pending catch-up window.
    Check,
    /// Execute one scheduled task.
    Task(ScheduledTask),
}

#[derive(Default)]
struct GroupState {
    worker_running: bool,
    check_pending: bool,
    tasks: VecDeque<ScheduledTask>,
}

/// Executes the actual work for one folder; implemented by the router.
#[async_trait]
pub trait GroupRunner: Send + Sync {
    /// Run the catch-up window for a folder, if any.
    async fn run_check(&self, folder: &str);
    /// Run one scheduled task.
    async fn run_task(&self, task: ScheduledTask);
}

/// A live agent child's published stdin.
struct LiveProcess {
    label: String,
    stdin: Option<ChildStdin>,
}

/// Registry of live agent processes keyed by folder.
#[derive(Default)]
pub struct LiveRegistry {
    inner: Mutex<HashMap<String, LiveProcess>>,
}

impl LiveRegistry {
    /// Publish a run's stdin. Replaces any stale entry for the folder.
    pub async fn register(&self, folder: &str, stdin: ChildStdin, label: String) {
        let mut guard = self.inner.lock().await;
        debug!(folder, label, "live process registered");
        guard.insert(
            folder.to_owned(),
            LiveProcess {
                label,
                stdin: Some(stdin),
            },
        );
    }

    /// Remove a run's entry once its process is gone.
    pub async fn clear(&self, folder: &str) {
        self.inner.lock().await.remove(folder);
    }

    /// Write a line to a live, open stdin. Returns false when there is no
    /// live process, its stdin was half-closed, or the write fails (the
    /// entry is dropped so the caller falls back to a fresh enqueue).
    pub async fn send_stdin(&self, folder: &str, text: &str) -> bool {
        let mut guard = self.inner.lock().await;
        let Some(proc) = guard.get_mut(folder) else {
            return false;
        };
        let Some(stdin) = proc.stdin.as_mut() else {
            return false;
        };

        let payload = format!("{text}\n");
        match stdin.write_all(payload.as_bytes()).await {
            Ok(()) => match stdin.flush().await {
                Ok(()) => true,
                Err(err) => {
                    warn!(folder, label = proc.label, %err, "stdin flush failed");
                    guard.remove(folder);
                    false
                }
            },
            Err(err) => {
                warn!(folder, label = proc.label, %err, "stdin write failed");
                guard.remove(folder);
                false
            }
        }
    }

    /// Half-close a live process's stdin, signalling end-of-session.
    pub async fn close_stdin(&self, folder: &str) {
        let mut guard = self.inner.lock().await;
        if let Some(proc) = guard.get_mut(folder) {
            if proc.stdin.take().is_some() {
                debug!(folder, label = proc.label, "stdin half-closed");
            }
        }
    }

    /// Half-close every live stdin; the shutdown path.
    pub async fn close_all(&self) {
        let mut guard = self.inner.lock().await;
        for (folder, proc) in guard.iter_mut() {
            if proc.stdin.take().is_some() {
                debug!(folder, label = proc.label, "stdin half-closed for shutdown");
            }
        }
    }
}

/// Per-workspace serialized executor.
pub struct GroupQueue {
    states: StdMutex<HashMap<String, GroupState>>,
    live: LiveRegistry,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl GroupQueue {
    /// Create a queue observing `cancel` for shutdown.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            states: StdMutex::new(HashMap::new()),
            live: LiveRegistry::default(),
            cancel,
            tracker: TaskTracker::new(),
        }
    }

    /// The live-process registry.
    #[must_use]
    pub fn live(&self) -> &LiveRegistry {
        &self.live
    }

    /// Mark work pending for a folder and start a worker if none runs.
    /// Idempotent while a run is in flight.
    pub fn enqueue_check(self: &Arc<Self>, folder: &str, runner: Arc<dyn GroupRunner>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut states = lock(&self.states);
        let state = states.entry(folder.to_owned()).or_default();
        state.check_pending = true;
        if !state.worker_running {
            state.worker_running = true;
            self.spawn_worker(folder.to_owned(), runner);
        }
    }

    /// Queue a scheduled task run behind the folder's worker.
    pub fn enqueue_task(self: &Arc<Self>, task: ScheduledTask, runner: Arc<dyn GroupRunner>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let folder = task.group_folder.clone();
        let mut states = lock(&self.states);
        let state = states.entry(folder.clone()).or_default();
        state.tasks.push_back(task);
        if !state.worker_running {
            state.worker_running = true;
            self.spawn_worker(folder, runner);
        }
    }

    /// Write a follow-up envelope into a live run's stdin.
    pub async fn send_stdin(&self, folder: &str, text: &str) -> bool {
        self.live.send_stdin(folder, text).await
    }

    /// Half-close a live run's stdin.
    pub async fn close_stdin(&self, folder: &str) {
        self.live.close_stdin(folder).await;
    }

    /// Stop accepting work, half-close live stdins, and wait up to `grace`
    /// for in-flight runs. Supervisors observe the same token and escalate
    /// to kill on their own.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.live.close_all().await;
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                grace_secs = grace.as_secs(),
                "group workers did not drain within grace window"
            );
        } else {
            info!("group queue drained");
        }
    }

    // Workers pull jobs until the folder is idle, then exit; the next
    // enqueue starts a fresh one.
    fn spawn_worker(self: &Arc<Self>, folder: String, runner: Arc<dyn GroupRunner>) {
        let cancel = self.cancel.clone();
        let queue = Arc::clone(self);
        self.tracker.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    queue.finish_worker(&folder);
                    return;
                }
                let Some(job) = queue.next_job(&folder) else {
                    return;
                };
                match job {
                    Job::Check => runner.run_check(&folder).await,
                    Job::Task(task) => runner.run_task(task).await,
                }
            }
        });
    }

    fn next_job(&self, folder: &str) -> Option<Job> {
        let mut states = lock(&self.states);
        let state = states.entry(folder.to_owned()).or_default();
        if state.check_pending {
            state.check_pending = false;
            return Some(Job::Check);
        }
        if let Some(task) = state.tasks.pop_front() {
            return Some(Job::Task(task));
        }
        state.worker_running = false;
        None
    }

    fn finish_worker(&self, folder: &str) {
        let mut states = lock(&self.states);
        if let Some(state) = states.get_mut(folder) {
            state.worker_running = false;
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
