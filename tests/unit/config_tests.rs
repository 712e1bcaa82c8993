//! Unit tests for configuration parsing and the path layout.

use std::path::PathBuf;

use nanoclaw::config::GlobalConfig;

#[test]
fn empty_toml_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("parse");

    assert_eq!(config.main_folder, "main");
    assert_eq!(config.container_runtime, "auto");
    assert_eq!(config.agent_runtime, "claude");
    assert_eq!(config.timing.poll_interval_ms, 2_000);
    assert_eq!(config.timing.scheduler_interval_ms, 60_000);
    assert_eq!(config.timing.ipc_interval_ms, 1_000);
    assert_eq!(config.timing.container_timeout_ms, 300_000);
    assert_eq!(config.timing.max_output_bytes, 10 * 1024 * 1024);
    assert!(config.require_trigger);
    assert_eq!(config.shutdown_grace_secs, 10);
}

#[test]
fn toml_overrides_apply() {
    let config = GlobalConfig::from_toml_str(
        r#"
data_dir = "/var/lib/nanoclaw"
main_folder = "operator"
assistant_name = "Clawdia"
container_runtime = "docker"
agent_runtime = "opencode"

[timing]
poll_interval_ms = 500
container_timeout_ms = 60000
"#,
    )
    .expect("parse");

    assert_eq!(config.data_dir, PathBuf::from("/var/lib/nanoclaw"));
    assert_eq!(config.main_folder, "operator");
    assert_eq!(config.assistant_name, "Clawdia");
    assert_eq!(config.container_runtime, "docker");
    assert_eq!(config.agent_runtime, "opencode");
    assert_eq!(config.timing.poll_interval_ms, 500);
    assert_eq!(config.timing.container_timeout_ms, 60_000);
    // Untouched values keep their defaults.
    assert_eq!(config.timing.ipc_interval_ms, 1_000);
}

#[test]
fn zero_poll_interval_is_rejected() {
    let result = GlobalConfig::from_toml_str("[timing]\npoll_interval_ms = 0\n");
    assert!(result.is_err());
}

#[test]
fn empty_main_folder_is_rejected() {
    let result = GlobalConfig::from_toml_str("main_folder = \"\"\n");
    assert!(result.is_err());
}

#[test]
fn path_layout_derives_from_data_dir() {
    let config = GlobalConfig::from_toml_str(
        "data_dir = \"/data\"\nworkspaces_dir = \"/ws\"\n",
    )
    .expect("parse");

    assert_eq!(config.store_path(), PathBuf::from("/data/nanoclaw.db"));
    assert_eq!(config.workspace_dir("family"), PathBuf::from("/ws/family"));
    assert_eq!(config.global_workspace_dir(), PathBuf::from("/ws/global"));
    assert_eq!(
        config.sessions_dir("family"),
        PathBuf::from("/data/sessions/family")
    );
    assert_eq!(config.ipc_dir("family"), PathBuf::from("/data/ipc/family"));
    assert_eq!(
        config.vm_image_path("family"),
        PathBuf::from("/data/vibe-images/family.raw")
    );
    assert_eq!(
        config.mount_policy_path(),
        PathBuf::from("/data/config/mounts.json")
    );
}

#[test]
fn explicit_mount_policy_path_wins() {
    let config = GlobalConfig::from_toml_str(
        "mount_policy_file = \"/etc/nanoclaw/mounts.json\"\n",
    )
    .expect("parse");
    assert_eq!(
        config.mount_policy_path(),
        PathBuf::from("/etc/nanoclaw/mounts.json")
    );
}

#[test]
fn is_main_compares_folder() {
    let config = GlobalConfig::from_toml_str("main_folder = \"hq\"\n").expect("parse");
    assert!(config.is_main("hq"));
    assert!(!config.is_main("family"));
}

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = GlobalConfig::load(&dir.path().join("absent.toml")).expect("load");
    assert_eq!(config.main_folder, "main");
}
