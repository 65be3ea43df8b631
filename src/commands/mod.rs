//! Command implementations
//!
//! Every command works on a [`Session`]: the settings file, the stack file
//! and the state store, wired into an [`Engine`] with one plugin adapter per
//! resource kind.

pub mod run;
pub mod state;

use crate::config::Settings;
use crate::plugin::PluginResolver;
use crate::stack::Stack;
use crate::Context;
use anyhow::{bail, Context as _, Result};
use dialoguer::Confirm;
use reconcile::{Engine, EngineOptions, FileBackend, StateStore};
use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::PathBuf;

/// Everything a command needs to talk to state and plugins
pub struct Session {
    pub settings: Settings,
    pub stack: Option<Stack>,
    pub state_dir: PathBuf,
}

impl Session {
    /// Load settings and the stack file; the stack may be absent when
    /// `require_stack` is false
    pub fn open(ctx: &Context, require_stack: bool) -> Result<Self> {
        let settings = Settings::load()?;
        let stack = if require_stack || ctx.file.exists() {
            Some(Stack::load(&ctx.file, &ctx.config)?)
        } else {
            log::debug!("No stack file at {}", ctx.file.display());
            None
        };
        let state_dir = settings.state_dir(ctx.state_dir.as_deref(), &ctx.file);
        log::debug!("State directory: {}", state_dir.display());
        Ok(Self {
            settings,
            stack,
            state_dir,
        })
    }

    pub fn stack(&self) -> Result<&Stack> {
        self.stack.as_ref().context("No stack file loaded")
    }

    pub fn store(&self) -> StateStore {
        let mut backend = FileBackend::new(&self.state_dir);
        if let Some(stale_after) = self.settings.lock_stale_after() {
            backend = backend.with_stale_after(stale_after);
        }
        StateStore::new(backend)
    }

    /// Engine with adapters for every declared kind and every recorded kind
    pub fn engine(&self, options: EngineOptions) -> Result<Engine> {
        let store = self.store();
        let snapshot = store.load()?;

        let mut kinds: BTreeSet<&str> = snapshot
            .resources
            .values()
            .chain(&snapshot.retired)
            .map(|state| state.kind.as_str())
            .collect();
        if let Some(stack) = &self.stack {
            kinds.extend(stack.declarations.resources.iter().map(|r| r.kind.as_str()));
        }

        let resolver = PluginResolver {
            declared: self
                .stack
                .as_ref()
                .map(|stack| stack.plugins.clone())
                .unwrap_or_default(),
            plugin_dir: self.settings.plugin_dir(),
        };
        let registry = resolver.registry(kinds, &self.settings.retry);
        log::debug!("Adapters for {} kinds", registry.len());

        Ok(Engine::new(registry, store).with_options(options))
    }
}

/// Ask before a destructive step; `--yes` is required without a terminal
pub fn confirm(prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        bail!("Refusing to continue without confirmation (pass --yes)");
    }
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}
