//! Router cursor and settings persistence.

use std::sync::Arc;

use chrono::DateTime;

use nanoclaw::persistence::db;
use nanoclaw::persistence::state_repo::StateRepo;

use super::test_helpers::ts;

async fn repo() -> StateRepo {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    StateRepo::new(pool)
}

#[tokio::test]
async fn watermark_defaults_to_epoch_and_persists() {
    let state = repo().await;

    assert_eq!(state.last_timestamp().await.expect("get"), DateTime::UNIX_EPOCH);

    state.set_last_timestamp(ts(42)).await.expect("set");
    assert_eq!(state.last_timestamp().await.expect("get"), ts(42));

    state.set_last_timestamp(ts(50)).await.expect("set");
    assert_eq!(state.last_timestamp().await.expect("get"), ts(50));
}

#[tokio::test]
async fn agent_cursors_are_per_folder() {
    let state = repo().await;

    state.set_agent_cursor("family", ts(10)).await.expect("set");
    state.set_agent_cursor("ops", ts(20)).await.expect("set");

    assert_eq!(state.agent_cursor("family").await.expect("get"), ts(10));
    assert_eq!(state.agent_cursor("ops").await.expect("get"), ts(20));
    assert_eq!(
        state.agent_cursor("unknown").await.expect("get"),
        DateTime::UNIX_EPOCH
    );
}

#[tokio::test]
async fn cursor_rollback_is_an_explicit_overwrite() {
    let state = repo().await;

    state.set_agent_cursor("family", ts(30)).await.expect("advance");
    state.set_agent_cursor("family", ts(10)).await.expect("rollback");
    assert_eq!(state.agent_cursor("family").await.expect("get"), ts(10));
}

#[tokio::test]
async fn settings_upsert_and_read() {
    let state = repo().await;

    assert!(state.get_setting("container_runtime").await.expect("get").is_none());

    state
        .set_setting("container_runtime", "docker")
        .await
        .expect("set");
    assert_eq!(
        state.get_setting("container_runtime").await.expect("get").as_deref(),
        Some("docker")
    );

    state
        .set_setting("container_runtime", "tart")
        .await
        .expect("overwrite");
    assert_eq!(
        state.get_setting("container_runtime").await.expect("get").as_deref(),
        Some("tart")
    );
}
