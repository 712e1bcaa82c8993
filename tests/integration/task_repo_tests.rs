//! Scheduled task repository behavior, including the schema upgrade path.

use std::sync::Arc;

use nanoclaw::models::group::{RegisteredGroup, SandboxConfig};
use nanoclaw::models::task::{ContextMode, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus};
use nanoclaw::persistence::db;
use nanoclaw::persistence::group_repo::GroupRepo;
use nanoclaw::persistence::schema;
use nanoclaw::persistence::session_repo::SessionRepo;
use nanoclaw::persistence::task_repo::TaskRepo;

use super::test_helpers::ts;

async fn repo() -> (TaskRepo, Arc<nanoclaw::persistence::SqlitePool>) {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    (TaskRepo::new(Arc::clone(&pool)), pool)
}

fn sample(folder: &str, next_run_secs: Option<i64>) -> ScheduledTask {
    let mut task = ScheduledTask::new(
        folder.to_owned(),
        "test:g1".to_owned(),
        "do the thing".to_owned(),
        ScheduleType::Cron,
        "0 9 * * 1".to_owned(),
        ContextMode::Group,
        next_run_secs.map(ts),
    );
    // Whole-second instant so the text roundtrip compares exactly.
    task.created_at = ts(0);
    task
}

#[tokio::test]
async fn create_get_roundtrip() {
    let (tasks, _pool) = repo().await;
    let task = sample("family", Some(100));

    tasks.create(&task).await.expect("create");
    let loaded = tasks.get(&task.id).await.expect("get").expect("present");

    assert_eq!(loaded, task);
}

#[tokio::test]
async fn due_selects_only_active_past_tasks() {
    let (tasks, _pool) = repo().await;

    let due = sample("family", Some(10));
    let future = sample("family", Some(10_000));
    let no_next = sample("family", None);
    let paused = sample("family", Some(10));

    for t in [&due, &future, &no_next, &paused] {
        tasks.create(t).await.expect("create");
    }
    tasks.set_status(&paused.id, TaskStatus::Paused).await.expect("pause");

    let found = tasks.due(ts(100)).await.expect("due");
    let ids: Vec<&str> = found.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![due.id.as_str()]);
}

#[tokio::test]
async fn finish_run_updates_bookkeeping() {
    let (tasks, _pool) = repo().await;
    let task = sample("family", Some(10));
    tasks.create(&task).await.expect("create");

    tasks
        .finish_run(&task.id, ts(100), "all good", Some(ts(200)), TaskStatus::Active)
        .await
        .expect("finish");

    let loaded = tasks.get(&task.id).await.expect("get").expect("present");
    assert_eq!(loaded.last_run, Some(ts(100)));
    assert_eq!(loaded.last_result.as_deref(), Some("all good"));
    assert_eq!(loaded.next_run, Some(ts(200)));
    assert_eq!(loaded.status, TaskStatus::Active);
}

#[tokio::test]
async fn delete_reports_whether_a_row_existed() {
    let (tasks, _pool) = repo().await;
    let task = sample("family", Some(10));
    tasks.create(&task).await.expect("create");

    assert!(tasks.delete(&task.id).await.expect("delete"));
    assert!(!tasks.delete(&task.id).await.expect("redelete"));
}

#[tokio::test]
async fn run_logs_append_and_purge() {
    let (tasks, _pool) = repo().await;
    let task = sample("family", Some(10));
    tasks.create(&task).await.expect("create");

    for (secs, status) in [(10, "success"), (20, "error")] {
        tasks
            .log_run(&TaskRunLog {
                task_id: task.id.clone(),
                run_at: ts(secs),
                duration_ms: 1_500,
                status: status.to_owned(),
                result: Some("r".into()),
            })
            .await
            .expect("log");
    }

    let logs = tasks.run_logs(&task.id).await.expect("logs");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].run_at, ts(20), "newest first");

    let purged = tasks.purge_run_logs(ts(15)).await.expect("purge");
    assert_eq!(purged, 1);
    assert_eq!(tasks.run_logs(&task.id).await.expect("logs").len(), 1);
}

#[tokio::test]
async fn schema_reapplies_idempotently() {
    let (_tasks, pool) = repo().await;
    // Both the DDL and the add-column upgrades must tolerate re-execution.
    schema::apply_schema(&pool).await.expect("first reapply");
    schema::apply_schema(&pool).await.expect("second reapply");
}

#[tokio::test]
async fn group_repo_roundtrips_sandbox_config() {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let groups = GroupRepo::new(pool);

    let group = RegisteredGroup {
        jid: "test:g1".into(),
        name: "Family".into(),
        folder: "family".into(),
        trigger: Some("@Andy".into()),
        requires_trigger: true,
        sandbox: Some(SandboxConfig {
            engine: Some("tart".into()),
            agent_cli: Some("codex".into()),
            timeout_ms: Some(120_000),
            cpus: Some(4),
            memory_mb: Some(4_096),
            ..SandboxConfig::default()
        }),
    };
    groups.upsert(&group).await.expect("upsert");

    let by_folder = groups.by_folder("family").await.expect("query").expect("present");
    assert_eq!(by_folder, group);

    let all = groups.all().await.expect("all");
    assert_eq!(all.len(), 1);
    assert_eq!(all["test:g1"], group);

    // Re-registration overwrites in place.
    let mut renamed = group.clone();
    renamed.name = "Family v2".into();
    groups.upsert(&renamed).await.expect("reupsert");
    assert_eq!(groups.all().await.expect("all")["test:g1"].name, "Family v2");
}

#[tokio::test]
async fn session_repo_upserts() {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let sessions = SessionRepo::new(pool);

    assert!(sessions.get("family").await.expect("get").is_none());

    sessions.set("family", "S1").await.expect("set");
    assert_eq!(sessions.get("family").await.expect("get").as_deref(), Some("S1"));

    sessions.set("family", "S2").await.expect("update");
    assert_eq!(sessions.get("family").await.expect("get").as_deref(), Some("S2"));
}

#[tokio::test]
async fn created_at_ordering_is_stable() {
    let (tasks, _pool) = repo().await;

    let mut first = sample("family", Some(10));
    first.created_at = ts(100);
    let mut second = sample("family", Some(10));
    second.created_at = ts(200);

    tasks.create(&second).await.expect("create");
    tasks.create(&first).await.expect("create");

    let listed = tasks.list_for_folder("family").await.expect("list");
    assert_eq!(listed[0].id, first.id, "oldest first");
}
