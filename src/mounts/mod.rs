//! Mount policy: validates additional host paths requested by a workspace.
//!
//! The policy file lives under the host config directory and is never
//! bind-mounted into any sandbox, so an agent cannot widen what it is
//! allowed to mount next time. It is re-read at the start of every run.
//!
//! Validation: expand `~`, canonicalize (symlinks resolve here, so an
//! escape via link lands outside the allowed roots and is refused), check
//! path components against the blocked globs, require an allowed-root
//! prefix, then force read-only where the policy demands it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::models::group::MountSpec;
use crate::{AppError, Result};

/// One allowed host subtree.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowedRoot {
    /// Host path prefix under which mounts may be requested.
    pub path: PathBuf,
    /// Whether read-write mounts are permitted under this root.
    #[serde(default)]
    pub allow_read_write: bool,
    /// Operator note; not interpreted.
    #[serde(default)]
    pub description: String,
}

/// Parsed mount policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MountPolicy {
    /// Subtrees mounts must fall under. Empty means no mounts at all.
    #[serde(default)]
    pub allowed_roots: Vec<AllowedRoot>,
    /// Globs matched against each path component (and, for patterns with a
    /// separator, the whole path).
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    /// Force read-only for every non-privileged workspace.
    #[serde(default)]
    pub non_main_read_only: bool,
}

/// A mount that passed validation, ready for engine consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// Canonicalized host path.
    pub host_path: PathBuf,
    /// Path under `/workspace/extra/` inside the sandbox.
    pub guest_path: String,
    /// Effective read-only flag after policy enforcement.
    pub readonly: bool,
}

impl MountPolicy {
    /// Load the policy file. A missing file yields the deny-all default.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file exists but cannot be parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("cannot read mount policy '{}': {err}", path.display()))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            AppError::Config(format!("invalid mount policy '{}': {err}", path.display()))
        })
    }

    /// Validate one requested mount for a workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MountRejected` when any rule denies the path.
    pub fn validate(&self, spec: &MountSpec, privileged: bool) -> Result<ResolvedMount> {
        let expanded = expand_home(&spec.host_path);

        let canonical = expanded.canonicalize().map_err(|err| {
            AppError::MountRejected(format!(
                "cannot resolve host path '{}': {err}",
                spec.host_path
            ))
        })?;

        self.check_blocked(&canonical)?;

        let root = self
            .allowed_roots
            .iter()
            .find(|root| {
                root.path
                    .canonicalize()
                    .map(|r| canonical.starts_with(&r))
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                AppError::MountRejected(format!(
                    "'{}' is not under any allowed root",
                    canonical.display()
                ))
            })?;

        let mut readonly = spec.readonly;
        if !privileged && self.non_main_read_only {
            readonly = true;
        }
        if !root.allow_read_write {
            readonly = true;
        }

        if spec.guest_path.is_empty() || spec.guest_path.contains("..") {
            return Err(AppError::MountRejected(format!(
                "invalid guest path '{}'",
                spec.guest_path
            )));
        }

        Ok(ResolvedMount {
            host_path: canonical,
            guest_path: spec.guest_path.trim_start_matches('/').to_owned(),
            readonly,
        })
    }

    /// Validate every requested mount; the first rejection aborts the run.
    ///
    /// # Errors
    ///
    /// Returns the first `AppError::MountRejected` encountered.
    pub fn validate_all(&self, specs: &[MountSpec], privileged: bool) -> Result<Vec<ResolvedMount>> {
        specs
            .iter()
            .map(|spec| self.validate(spec, privileged))
            .collect()
    }

    fn check_blocked(&self, path: &Path) -> Result<()> {
        for pattern in &self.blocked_patterns {
            let glob_pat = match glob::Pattern::new(pattern) {
                Ok(p) => p,
                Err(err) => {
                    warn!(pattern, %err, "invalid blocked pattern, skipping");
                    continue;
                }
            };

            if pattern.contains('/') {
                if glob_pat.matches_path(path) {
                    return Err(AppError::MountRejected(format!(
                        "'{}' matches blocked pattern '{pattern}'",
                        path.display()
                    )));
                }
                continue;
            }

            for component in path.components() {
                let text = component.as_os_str().to_string_lossy();
                if glob_pat.matches(&text) {
                    return Err(AppError::MountRejected(format!(
                        "component '{text}' matches blocked pattern '{pattern}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand a leading `~` using `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}
