//! Runtime selector precedence: group config → settings row → default.

use std::path::PathBuf;
use std::sync::Arc;

use nanoclaw::config::GlobalConfig;
use nanoclaw::models::group::{RegisteredGroup, SandboxConfig};
use nanoclaw::persistence::db;
use nanoclaw::persistence::state_repo::StateRepo;
use nanoclaw::sandbox::runtime::RuntimeSelector;
use nanoclaw::sandbox::{AgentCli, EngineKind, EngineSet};

fn group(sandbox: Option<SandboxConfig>) -> RegisteredGroup {
    RegisteredGroup {
        jid: "test:g1".into(),
        name: "Family".into(),
        folder: "family".into(),
        trigger: None,
        requires_trigger: false,
        sandbox,
    }
}

async fn selector(config: GlobalConfig) -> (RuntimeSelector, StateRepo) {
    let pool = Arc::new(db::connect_memory().await.expect("db"));
    let state = StateRepo::new(Arc::clone(&pool));
    let engines = EngineSet::standard(PathBuf::from("/nonexistent/base.raw"));
    let selector = RuntimeSelector::new(Arc::new(config), StateRepo::new(pool), engines);
    (selector, state)
}

fn host_config() -> GlobalConfig {
    let mut config = GlobalConfig::from_toml_str("").expect("defaults");
    // The host engine is always available, keeping these tests
    // independent of what container tooling the build machine carries.
    config.container_runtime = "host".into();
    config
}

#[tokio::test]
async fn defaults_apply_when_nothing_overrides() {
    let (selector, _state) = selector(host_config()).await;

    let (engine, cli) = selector.select(&group(None)).await.expect("select");
    assert_eq!(engine, EngineKind::Host);
    assert_eq!(cli, AgentCli::Claude);
}

#[tokio::test]
async fn settings_row_beats_the_config_default() {
    let (selector, state) = selector(host_config()).await;
    state
        .set_setting("agent_runtime", "codex")
        .await
        .expect("set");

    let (_, cli) = selector.select(&group(None)).await.expect("select");
    assert_eq!(cli, AgentCli::Codex);
}

#[tokio::test]
async fn group_config_beats_the_settings_row() {
    let (selector, state) = selector(host_config()).await;
    state
        .set_setting("agent_runtime", "codex")
        .await
        .expect("set");

    let sandbox = SandboxConfig {
        agent_cli: Some("opencode".into()),
        ..SandboxConfig::default()
    };
    let (_, cli) = selector.select(&group(Some(sandbox))).await.expect("select");
    assert_eq!(cli, AgentCli::Opencode);
}

#[tokio::test]
async fn settings_are_reread_on_every_selection() {
    let (selector, state) = selector(host_config()).await;

    let (_, before) = selector.select(&group(None)).await.expect("select");
    assert_eq!(before, AgentCli::Claude);

    state
        .set_setting("agent_runtime", "opencode")
        .await
        .expect("set");
    let (_, after) = selector.select(&group(None)).await.expect("select");
    assert_eq!(after, AgentCli::Opencode, "no restart needed");
}

#[tokio::test]
async fn explicit_host_engine_is_honored_without_substitution() {
    let (selector, _state) = selector(host_config()).await;

    let sandbox = SandboxConfig {
        engine: Some("host".into()),
        ..SandboxConfig::default()
    };
    let (engine, _) = selector.select(&group(Some(sandbox))).await.expect("select");
    assert_eq!(engine, EngineKind::Host);
}

#[tokio::test]
async fn unknown_selections_error() {
    let (selector, _state) = selector(host_config()).await;

    let sandbox = SandboxConfig {
        engine: Some("chroot".into()),
        ..SandboxConfig::default()
    };
    assert!(selector.select(&group(Some(sandbox))).await.is_err());

    let sandbox = SandboxConfig {
        agent_cli: Some("hal9000".into()),
        ..SandboxConfig::default()
    };
    assert!(selector.select(&group(Some(sandbox))).await.is_err());
}
