//! Runtime selector: engine × agent CLI resolution.
//!
//! Each axis resolves independently, first non-empty wins: the group's
//! sandbox config, a `settings` row, a `NANOCLAW_*` environment variable,
//! then the configured default. Settings are re-read at the start of every
//! run, so a settings write changes the very next run without a restart.
//!
//! When the chosen engine's binary is absent the selector walks the
//! fallback chain: native container → persistent VM → one-shot VM →
//! cross-platform container. The host engine is deliberately excluded
//! from fallback; it is only reachable through explicit configuration.

use std::sync::Arc;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::{env_override, keys, GlobalConfig};
use crate::models::group::RegisteredGroup;
use crate::persistence::state_repo::StateRepo;
use crate::{AppError, Result};

use super::{AgentCli, EngineKind, EngineSet};

/// Fallback order when the selected engine is unavailable.
const FALLBACK_CHAIN: [EngineKind; 4] = [
    EngineKind::Container,
    EngineKind::Vibe,
    EngineKind::Tart,
    EngineKind::Docker,
];

/// Resolves `(engine, agent CLI)` for each run.
pub struct RuntimeSelector {
    config: Arc<GlobalConfig>,
    state: StateRepo,
    engines: EngineSet,
    last_logged: Mutex<Option<(EngineKind, AgentCli)>>,
}

impl RuntimeSelector {
    /// Create a selector.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, state: StateRepo, engines: EngineSet) -> Self {
        Self {
            config,
            state,
            engines,
            last_logged: Mutex::new(None),
        }
    }

    /// Resolve the engine and agent CLI for a group's next run.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unparseable selections or when no
    /// engine in the fallback chain is available.
    pub async fn select(&self, group: &RegisteredGroup) -> Result<(EngineKind, AgentCli)> {
        let engine_choice = self
            .axis_value(
                group.sandbox.as_ref().and_then(|s| s.engine.as_deref()),
                keys::CONTAINER_RUNTIME,
                &self.config.container_runtime,
            )
            .await?;
        let cli_choice = self
            .axis_value(
                group.sandbox.as_ref().and_then(|s| s.agent_cli.as_deref()),
                keys::AGENT_RUNTIME,
                &self.config.agent_runtime,
            )
            .await?;

        let engine = self.resolve_engine(&engine_choice)?;
        let cli = AgentCli::parse(&cli_choice)?;

        let mut last = self
            .last_logged
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last != Some((engine, cli)) {
            info!(
                engine = engine.as_str(),
                agent = cli.as_str(),
                "runtime selected"
            );
            *last = Some((engine, cli));
        }

        Ok((engine, cli))
    }

    async fn axis_value(
        &self,
        group_value: Option<&str>,
        settings_key: &str,
        default: &str,
    ) -> Result<String> {
        if let Some(v) = group_value.filter(|v| !v.is_empty()) {
            return Ok(v.to_owned());
        }
        if let Some(v) = self.state.get_setting(settings_key).await? {
            if !v.is_empty() {
                return Ok(v);
            }
        }
        if let Some(v) = env_override(settings_key) {
            return Ok(v);
        }
        Ok(default.to_owned())
    }

    fn resolve_engine(&self, choice: &str) -> Result<EngineKind> {
        if choice == "auto" {
            return self.first_available(None);
        }

        let requested = EngineKind::parse(choice)?;
        if self.engines.available(requested) {
            return Ok(requested);
        }

        // The host engine is an explicit opt-in; never substitute for it.
        if requested == EngineKind::Host {
            return Ok(requested);
        }

        warn!(
            requested = requested.as_str(),
            "selected engine unavailable, walking fallback chain"
        );
        self.first_available(Some(requested))
    }

    fn first_available(&self, skip: Option<EngineKind>) -> Result<EngineKind> {
        FALLBACK_CHAIN
            .into_iter()
            .filter(|kind| Some(*kind) != skip)
            .find(|kind| self.engines.available(*kind))
            .ok_or_else(|| {
                AppError::Config("no sandbox engine available on this host".into())
            })
    }
}
