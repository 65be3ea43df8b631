//! Global settings from `~/.config/virtstack/config.toml`
//!
//! Command-line flags and environment variables win over the file, which
//! wins over built-in defaults.

use crate::retry::RetryConfig;
use anyhow::{Context, Result};
use reconcile::{EngineOptions, ReplaceCleanup};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the state directory created next to a stack file
pub const STATE_DIR_NAME: &str = ".virtstack";

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("virtstack"))
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Operations run in parallel
    pub jobs: Option<usize>,
    /// State directory used for every stack
    pub state_dir: Option<String>,
    /// Directory searched for `virtstack-plugin-<name>` executables
    pub plugin_dir: Option<String>,
    /// Age after which a state lock is considered abandoned
    pub lock_stale_after_secs: Option<u64>,
    pub replace_cleanup: Option<ReplaceCleanup>,
    pub retry: RetryConfig,
}

impl Settings {
    /// Load the settings file, defaulting when it does not exist
    pub fn load() -> Result<Self> {
        Self::load_from(&config_dir()?.join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read settings file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid TOML format in {}", path.display()))
    }

    /// Engine options after applying command-line overrides
    pub fn engine_options(
        &self,
        jobs: Option<usize>,
        replace_cleanup: Option<ReplaceCleanup>,
    ) -> EngineOptions {
        let defaults = EngineOptions::default();
        EngineOptions {
            jobs: jobs.or(self.jobs).unwrap_or(defaults.jobs).max(1),
            replace_cleanup: replace_cleanup
                .or(self.replace_cleanup)
                .unwrap_or(defaults.replace_cleanup),
        }
    }

    /// State directory: flag, then settings, then next to the stack file
    pub fn state_dir(&self, flag: Option<&Path>, stack_file: &Path) -> PathBuf {
        if let Some(dir) = flag {
            return expand(&dir.to_string_lossy());
        }
        if let Some(dir) = &self.state_dir {
            return expand(dir);
        }
        stack_file
            .parent()
            .map_or_else(|| PathBuf::from(STATE_DIR_NAME), |p| p.join(STATE_DIR_NAME))
    }

    pub fn plugin_dir(&self) -> Option<PathBuf> {
        self.plugin_dir.as_deref().map(expand)
    }

    pub fn lock_stale_after(&self) -> Option<chrono::Duration> {
        self.lock_stale_after_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(chrono::Duration::try_seconds)
    }
}

/// Expand `~` and environment variables in a configured path
pub fn expand(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            log::warn!("Could not expand {path}: {e}");
            PathBuf::from(shellexpand::tilde(path).as_ref())
        }
    }
}
