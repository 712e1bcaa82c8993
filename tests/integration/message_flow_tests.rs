//! End-to-end message loop flows: catch-up context, trigger suppression,
//! cursor rollback on failure.

use std::time::Duration;

use nanoclaw::router::message_loop;

use super::test_helpers::{
    dump_script, fail_script, marker_runs, ok_script, register_group, seed_message,
    start_router, test_config, ts, wait_until,
};

const G1: &str = "test:g1";

#[tokio::test]
async fn triggered_window_reaches_agent_with_full_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("stdin.json");
    let config = test_config(dir.path(), &dump_script(&dump, "on it", None));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", Some("@Andy"), true).await;
    seed_message(&router, G1, "Alice", "pizza tonight?", ts(1)).await;
    seed_message(&router, G1, "Bob", "sure", ts(2)).await;
    seed_message(&router, G1, "Alice", "@Andy toppings?", ts(3)).await;

    message_loop::tick(&router).await.expect("tick");

    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 1, Duration::from_secs(5)).await,
        "expected exactly one reply"
    );
    let sent = sent.lock().expect("lock");
    assert_eq!(sent[0], (G1.to_owned(), "on it".to_owned()));

    // The agent saw the whole window, in order, as one envelope.
    let stdin = std::fs::read_to_string(&dump).expect("stdin dump");
    let first = stdin.find("pizza tonight?").expect("first");
    let second = stdin.find("sure").expect("second");
    let third = stdin.find("@Andy toppings?").expect("third");
    assert!(first < second && second < third);

    // Both cursors landed on the last message.
    assert_eq!(router.ctx.state.last_timestamp().await.expect("wm"), ts(3));
    assert!(
        wait_until_cursor(&router, "family", ts(3)).await,
        "agent cursor must advance to t3"
    );
}

#[tokio::test]
async fn untriggered_messages_accumulate_until_trigger() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("stdin.json");
    let config = test_config(dir.path(), &dump_script(&dump, "ack", None));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", Some("@Andy"), true).await;
    seed_message(&router, G1, "Alice", "hi", ts(3)).await;
    seed_message(&router, G1, "Bob", "yo", ts(4)).await;

    message_loop::tick(&router).await.expect("tick");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Seen, but not shown to any agent.
    assert_eq!(router.ctx.state.last_timestamp().await.expect("wm"), ts(4));
    assert_eq!(
        router.ctx.state.agent_cursor("family").await.expect("cursor"),
        chrono::DateTime::UNIX_EPOCH
    );
    assert!(sent.lock().expect("lock").is_empty());

    // The trigger arrives; the accumulated context rides along.
    seed_message(&router, G1, "Alice", "@Andy?", ts(5)).await;
    message_loop::tick(&router).await.expect("tick");

    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 1, Duration::from_secs(5)).await,
        "expected one reply after trigger"
    );
    let stdin = std::fs::read_to_string(&dump).expect("stdin dump");
    for content in ["hi", "yo", "@Andy?"] {
        assert!(stdin.contains(content), "missing '{content}' in prompt");
    }
}

#[tokio::test]
async fn assistant_messages_are_never_routed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path(), &ok_script("nope", None));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Andy", "I am the assistant", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(sent.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn failed_run_rolls_back_cursor_and_retries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let marker = dir.path().join("runs");
    let config = test_config(dir.path(), &fail_script(&marker));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", Some("@Andy"), true).await;
    seed_message(&router, G1, "Alice", "@Andy break things", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| marker_runs(&marker) >= 1, Duration::from_secs(5)).await,
        "first run must happen"
    );
    // Give the rollback a moment to land after the process exit.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(sent.lock().expect("lock").is_empty(), "no reply on failure");
    assert_eq!(
        router.ctx.state.agent_cursor("family").await.expect("cursor"),
        chrono::DateTime::UNIX_EPOCH,
        "cursor must roll back for retry"
    );

    // Next tick retries the same window: at-least-once per trigger.
    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| marker_runs(&marker) >= 2, Duration::from_secs(5)).await,
        "retry run must happen"
    );
}

#[tokio::test]
async fn timed_out_run_is_killed_and_rolled_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path(), "sleep 30");
    config.timing.container_timeout_ms = 500;
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "hang forever", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");

    // The run starts: the cursor advances ahead of the spawn.
    assert!(
        wait_until_cursor_for(&router, "family", ts(1), Duration::from_secs(5)).await,
        "cursor must advance when the run starts"
    );

    // Deadline fires at 500ms, then the kill path runs its grace window.
    let rolled_back = wait_until_cursor_for(
        &router,
        "family",
        chrono::DateTime::UNIX_EPOCH,
        Duration::from_secs(10),
    )
    .await;
    assert!(rolled_back, "cursor must roll back after the timeout kill");
    assert!(sent.lock().expect("lock").is_empty(), "no reply that turn");
}

#[tokio::test]
async fn untriggered_group_without_pattern_always_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path(), &ok_script("hello", None));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "anything at all", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 1, Duration::from_secs(5)).await,
        "expected one reply"
    );
}

async fn wait_until_cursor(
    router: &std::sync::Arc<nanoclaw::router::Router>,
    folder: &str,
    expected: chrono::DateTime<chrono::Utc>,
) -> bool {
    wait_until_cursor_for(router, folder, expected, Duration::from_secs(5)).await
}

async fn wait_until_cursor_for(
    router: &std::sync::Arc<nanoclaw::router::Router>,
    folder: &str,
    expected: chrono::DateTime<chrono::Utc>,
    budget: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if router.ctx.state.agent_cursor(folder).await.expect("cursor") == expected {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
