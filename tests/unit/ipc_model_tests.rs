//! Unit tests for IPC request wire parsing.

use nanoclaw::models::ipc::IpcRequest;

#[test]
fn message_request_parses() {
    let req: IpcRequest =
        serde_json::from_str(r#"{"type":"message","chatJid":"wa:g1","text":"hello"}"#)
            .expect("parse");
    assert_eq!(
        req,
        IpcRequest::Message {
            chat_jid: "wa:g1".into(),
            text: "hello".into(),
        }
    );
}

#[test]
fn message_request_accepts_snake_case_alias() {
    let req: IpcRequest =
        serde_json::from_str(r#"{"type":"message","chat_jid":"wa:g1","text":"hi"}"#)
            .expect("parse");
    assert!(matches!(req, IpcRequest::Message { ref chat_jid, .. } if chat_jid == "wa:g1"));
}

#[test]
fn schedule_task_parses_with_defaults() {
    let req: IpcRequest = serde_json::from_str(
        r#"{"type":"schedule_task","prompt":"water the plants",
            "schedule_type":"cron","schedule_value":"0 9 * * 1"}"#,
    )
    .expect("parse");

    let IpcRequest::ScheduleTask {
        prompt,
        schedule_type,
        schedule_value,
        context_mode,
        group_folder,
        chat_jid,
    } = req
    else {
        panic!("wrong variant");
    };
    assert_eq!(prompt, "water the plants");
    assert_eq!(schedule_type, "cron");
    assert_eq!(schedule_value, "0 9 * * 1");
    assert!(context_mode.is_none());
    assert!(group_folder.is_none());
    assert!(chat_jid.is_none());
}

#[test]
fn schedule_task_parses_camel_case_target() {
    let req: IpcRequest = serde_json::from_str(
        r#"{"type":"schedule_task","prompt":"p","schedule_type":"interval",
            "schedule_value":"60000","context_mode":"isolated","groupFolder":"ops"}"#,
    )
    .expect("parse");

    let IpcRequest::ScheduleTask {
        context_mode,
        group_folder,
        ..
    } = req
    else {
        panic!("wrong variant");
    };
    assert_eq!(context_mode.as_deref(), Some("isolated"));
    assert_eq!(group_folder.as_deref(), Some("ops"));
}

#[test]
fn task_control_requests_parse() {
    for (kind, json) in [
        ("pause", r#"{"type":"pause_task","taskId":"t1"}"#),
        ("resume", r#"{"type":"resume_task","task_id":"t1"}"#),
        ("cancel", r#"{"type":"cancel_task","taskId":"t1"}"#),
        ("get", r#"{"type":"get_task","taskId":"t1"}"#),
    ] {
        let req: IpcRequest = serde_json::from_str(json).expect(kind);
        let id = match req {
            IpcRequest::PauseTask { task_id }
            | IpcRequest::ResumeTask { task_id }
            | IpcRequest::CancelTask { task_id }
            | IpcRequest::GetTask { task_id } => task_id,
            other => panic!("{kind}: wrong variant {other:?}"),
        };
        assert_eq!(id, "t1");
    }
}

#[test]
fn list_and_refresh_parse_without_payload() {
    let list: IpcRequest = serde_json::from_str(r#"{"type":"list_tasks"}"#).expect("parse");
    assert_eq!(list, IpcRequest::ListTasks);

    let refresh: IpcRequest =
        serde_json::from_str(r#"{"type":"refresh_groups"}"#).expect("parse");
    assert_eq!(refresh, IpcRequest::RefreshGroups);
}

#[test]
fn register_group_parses_with_container_config() {
    let req: IpcRequest = serde_json::from_str(
        r#"{"type":"register_group","jid":"wa:g9","name":"Ops","folder":"ops",
            "trigger":"@Andy","requiresTrigger":true,
            "containerConfig":{
                "engine":"docker",
                "agentCli":"codex",
                "timeoutMs":120000,
                "mounts":[{"hostPath":"~/share","guestPath":"share","readonly":true}]
            }}"#,
    )
    .expect("parse");

    let IpcRequest::RegisterGroup {
        jid,
        folder,
        requires_trigger,
        container_config,
        ..
    } = req
    else {
        panic!("wrong variant");
    };
    assert_eq!(jid, "wa:g9");
    assert_eq!(folder, "ops");
    assert_eq!(requires_trigger, Some(true));

    let config = container_config.expect("config");
    assert_eq!(config.engine.as_deref(), Some("docker"));
    assert_eq!(config.agent_cli.as_deref(), Some("codex"));
    assert_eq!(config.timeout_ms, Some(120_000));
    assert_eq!(config.mounts.len(), 1);
    assert_eq!(config.mounts[0].guest_path, "share");
    assert!(config.mounts[0].readonly);
}

#[test]
fn unknown_type_is_rejected() {
    let result: Result<IpcRequest, _> =
        serde_json::from_str(r#"{"type":"drop_database"}"#);
    assert!(result.is_err());
}

#[test]
fn missing_discriminant_is_rejected() {
    let result: Result<IpcRequest, _> = serde_json::from_str(r#"{"text":"hello"}"#);
    assert!(result.is_err());
}
