//! Session propagation ordering: emitted session handles persist before
//! the reply goes out and ride the next run's stdin.

use std::time::Duration;

use nanoclaw::router::message_loop;

use super::test_helpers::{
    dump_script, register_group, seed_message, start_router, test_config, ts, wait_until,
};

const G1: &str = "test:g1";

#[tokio::test]
async fn emitted_session_persists_and_feeds_the_next_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dump = dir.path().join("stdin.json");
    let config = test_config(dir.path(), &dump_script(&dump, "hello", Some("S1")));
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "first", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 1, Duration::from_secs(5)).await
    );
    assert_eq!(
        router.ctx.sessions.get("family").await.expect("get").as_deref(),
        Some("S1"),
        "session must persist"
    );
    // First run had no session to pass.
    let first_stdin = std::fs::read_to_string(&dump).expect("dump");
    assert!(!first_stdin.contains("sessionId"), "got {first_stdin}");

    // Second run resumes with S1 on stdin.
    seed_message(&router, G1, "Alice", "second", ts(2)).await;
    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 2, Duration::from_secs(5)).await
    );

    let second_stdin = std::fs::read_to_string(&dump).expect("dump");
    assert!(
        second_stdin.contains(r#""sessionId":"S1""#),
        "got {second_stdin}"
    );
}

#[tokio::test]
async fn two_frame_run_sends_both_replies_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Frame one carries the session, frame two only text.
    let script = "cat >/dev/null; \
        printf '%s\\n' '---NANOCLAW_OUTPUT_START---' \
        '{\"status\":\"success\",\"result\":\"hello\",\"newSessionId\":\"S1\"}' \
        '---NANOCLAW_OUTPUT_END---' '---NANOCLAW_OUTPUT_START---' \
        '{\"status\":\"success\",\"result\":\"world\"}' '---NANOCLAW_OUTPUT_END---'";
    let config = test_config(dir.path(), script);
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "go", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 2, Duration::from_secs(5)).await
    );

    let sent = sent.lock().expect("lock");
    assert_eq!(sent[0].1, "hello");
    assert_eq!(sent[1].1, "world");
    drop(sent);

    assert_eq!(
        router.ctx.sessions.get("family").await.expect("get").as_deref(),
        Some("S1")
    );
}

#[tokio::test]
async fn internal_spans_are_stripped_from_replies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = "cat >/dev/null; \
        printf '%s\\n' '---NANOCLAW_OUTPUT_START---' \
        '{\"status\":\"success\",\"result\":\"public <internal>chain of thought</internal> text\"}' \
        '---NANOCLAW_OUTPUT_END---'";
    let config = test_config(dir.path(), script);
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "go", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    assert!(
        wait_until(|| sent.lock().expect("lock").len() == 1, Duration::from_secs(5)).await
    );

    let sent = sent.lock().expect("lock");
    assert_eq!(sent[0].1, "public  text");
}

#[tokio::test]
async fn all_internal_reply_sends_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = "cat >/dev/null; \
        printf '%s\\n' '---NANOCLAW_OUTPUT_START---' \
        '{\"status\":\"success\",\"result\":\"<internal>only notes</internal>\"}' \
        '---NANOCLAW_OUTPUT_END---'";
    let config = test_config(dir.path(), script);
    let (router, sent, _pool, _cancel) = start_router(config).await;

    register_group(&router, G1, "family", None, false).await;
    seed_message(&router, G1, "Alice", "go", ts(1)).await;

    message_loop::tick(&router).await.expect("tick");
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The run completed (no rollback) without any outbound send.
    assert_eq!(
        router.ctx.state.agent_cursor("family").await.expect("cursor"),
        ts(1)
    );
    assert!(sent.lock().expect("lock").is_empty());
}
