//! Unit tests for the stdin envelope, escaping, and internal stripping.

use chrono::{TimeZone, Utc};

use nanoclaw::agent::prompt::{format_messages, strip_internal, xml_escape, AgentInput};
use nanoclaw::models::chat::StoredMessage;

fn msg(sender: &str, content: &str, secs: i64) -> StoredMessage {
    StoredMessage {
        id: format!("m{secs}"),
        chat_jid: "test:g1".into(),
        sender: sender.to_lowercase(),
        sender_name: sender.into(),
        content: content.into(),
        timestamp: Utc.timestamp_opt(secs, 0).single().expect("ts"),
        from_self: false,
    }
}

#[test]
fn envelope_contains_messages_in_order() {
    let rendered = format_messages(&[
        msg("Alice", "pizza tonight?", 1),
        msg("Bob", "sure", 2),
        msg("Alice", "@Andy toppings?", 3),
    ]);

    assert!(rendered.starts_with("<messages>\n"));
    assert!(rendered.ends_with("</messages>"));

    let first = rendered.find("pizza tonight?").expect("first");
    let second = rendered.find("sure").expect("second");
    let third = rendered.find("@Andy toppings?").expect("third");
    assert!(first < second && second < third);

    assert!(rendered.contains(r#"sender="Alice""#));
    assert!(rendered.contains(r#"time="1970-01-01T00:00:01.000Z""#));
}

#[test]
fn envelope_escapes_special_characters() {
    let rendered = format_messages(&[msg("A<B>&\"C", "1 < 2 && \"yes\"", 1)]);

    assert!(rendered.contains(r#"sender="A&lt;B&gt;&amp;&quot;C""#));
    assert!(rendered.contains("1 &lt; 2 &amp;&amp; &quot;yes&quot;"));
    assert!(!rendered.contains("A<B>"));
}

#[test]
fn xml_escape_covers_the_four_specials() {
    assert_eq!(xml_escape("a&b<c>d\"e"), "a&amp;b&lt;c&gt;d&quot;e");
    assert_eq!(xml_escape("plain"), "plain");
}

#[test]
fn strip_internal_removes_spans() {
    assert_eq!(
        strip_internal("before <internal>secret</internal> after"),
        "before  after"
    );
    assert_eq!(
        strip_internal("<internal>a</internal>x<internal>b</internal>"),
        "x"
    );
    assert_eq!(strip_internal("no spans here"), "no spans here");
}

#[test]
fn strip_internal_drops_unterminated_remainder() {
    assert_eq!(strip_internal("keep <internal>never closed"), "keep");
}

#[test]
fn strip_internal_trims_result() {
    assert_eq!(strip_internal("  <internal>x</internal>  "), "");
}

#[test]
fn agent_input_serializes_camel_case() {
    let input = AgentInput {
        prompt: "<messages></messages>".into(),
        session_id: Some("S1".into()),
        group_folder: "family".into(),
        chat_jid: "test:g1".into(),
        is_main: false,
        is_scheduled_task: false,
    };
    let json = serde_json::to_value(&input).expect("serialize");

    assert_eq!(json["sessionId"], "S1");
    assert_eq!(json["groupFolder"], "family");
    assert_eq!(json["chatJid"], "test:g1");
    assert_eq!(json["isMain"], false);
    // Absent when false.
    assert!(json.get("isScheduledTask").is_none());
}

#[test]
fn agent_input_omits_missing_session() {
    let input = AgentInput {
        prompt: "p".into(),
        session_id: None,
        group_folder: "main".into(),
        chat_jid: "test:g1".into(),
        is_main: true,
        is_scheduled_task: true,
    };
    let json = serde_json::to_value(&input).expect("serialize");

    assert!(json.get("sessionId").is_none());
    assert_eq!(json["isScheduledTask"], true);
}
