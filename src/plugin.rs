//! Provider adapters backed by external plugin executables
//!
//! A plugin is invoked once per call as `<command...> <verb> <kind>` with a
//! JSON request on stdin and answers with one JSON document on stdout:
//!
//! | verb     | response                         |
//! |----------|----------------------------------|
//! | `create` | `{"id": "...", "outputs": {..}}` |
//! | `read`   | `{"found": bool, "outputs": {..}}` |
//! | `update` | `{"outputs": {..}}`              |
//! | `delete` | `{}`                             |
//!
//! Any verb may answer `{"error": {"message": "...", "retryable": bool}}`.

use crate::retry::{RetryConfig, Retryable, with_retry};
use reconcile::{
    AdapterContext, AdapterRegistry, Arguments, Created, Outputs, ProviderAdapter, ProviderError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;

/// Prefix of plugin executables looked up on `PATH` or in the plugin directory
pub const PLUGIN_PREFIX: &str = "virtstack-plugin-";

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("could not run plugin {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("plugin {program} sent an invalid response: {reason}")]
    Protocol { program: String, reason: String },

    #[error("{message}")]
    Remote { message: String, retryable: bool },
}

impl Retryable for PluginError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote { retryable: true, .. })
    }
}

impl From<PluginError> for ProviderError {
    fn from(error: PluginError) -> Self {
        match error {
            PluginError::Remote { message, .. } => Self::Remote(message),
            PluginError::Protocol { .. } => Self::InvalidArguments(error.to_string()),
            other => Self::Other(other.into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a Arguments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<&'a Arguments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_args: Option<&'a Arguments>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Response {
    id: Option<String>,
    found: Option<bool>,
    outputs: Option<Outputs>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    message: String,
    #[serde(default)]
    retryable: bool,
}

/// Adapter running one plugin command for every kind it serves
#[derive(Debug, Clone)]
pub struct ExecAdapter {
    command: Vec<String>,
    retry: RetryConfig,
}

impl ExecAdapter {
    /// `command` is the program followed by fixed leading arguments
    pub fn new(command: Vec<String>, retry: RetryConfig) -> Self {
        Self { command, retry }
    }

    fn program(&self) -> &str {
        self.command.first().map_or("", String::as_str)
    }

    fn call(&self, verb: &str, ctx: &AdapterContext<'_>, request: &Request<'_>) -> Result<Response, ProviderError> {
        let input = serde_json::to_vec(request)
            .map_err(|e| ProviderError::InvalidArguments(e.to_string()))?;
        let what = format!("{verb} {}", ctx.name);
        with_retry(&self.retry, &what, || self.invoke(verb, ctx.kind, &input)).map_err(Into::into)
    }

    fn invoke(&self, verb: &str, kind: &str, input: &[u8]) -> Result<Response, PluginError> {
        let program = self.program().to_string();
        log::debug!("Running {program} {verb} {kind}");
        let mut child = Command::new(&program)
            .args(self.command.iter().skip(1))
            .args([verb, kind])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PluginError::Spawn {
                program: program.clone(),
                source,
            })?;
        // The request is written on its own thread while stdout drains.
        let stdin = child.stdin.take();
        let (output, written) = std::thread::scope(|scope| {
            let writer = stdin.map(|mut stdin| scope.spawn(move || stdin.write_all(input)));
            let output = child.wait_with_output();
            let written = writer.map_or(Ok(()), |writer| {
                writer
                    .join()
                    .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")))
            });
            (output, written)
        });
        let output = output.map_err(|source| PluginError::Spawn {
            program: program.clone(),
            source,
        })?;
        if let Err(e) = written {
            log::debug!("{program} did not take the whole request: {e}");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let response: Option<Response> = serde_json::from_str(stdout.trim()).ok();
        if let Some(error) = response.as_ref().and_then(|r| r.error.as_ref()) {
            return Err(PluginError::Remote {
                message: error.message.clone(),
                retryable: error.retryable,
            });
        }
        if !output.status.success() {
            return Err(PluginError::Exit {
                program,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        response.ok_or_else(|| PluginError::Protocol {
            program,
            reason: format!("expected JSON, got `{}`", stdout.trim()),
        })
    }

    fn protocol(&self, reason: &str) -> ProviderError {
        PluginError::Protocol {
            program: self.program().to_string(),
            reason: reason.to_string(),
        }
        .into()
    }
}

impl ProviderAdapter for ExecAdapter {
    fn create(&self, ctx: &AdapterContext<'_>, args: &Arguments) -> Result<Created, ProviderError> {
        let request = Request {
            name: ctx.name,
            provider: ctx.provider.map(|p| &p.arguments),
            id: None,
            args: Some(args),
            old_args: None,
        };
        let response = self.call("create", ctx, &request)?;
        let id = response
            .id
            .ok_or_else(|| self.protocol("create response has no `id`"))?;
        Ok(Created::new(id, response.outputs.unwrap_or_default()))
    }

    fn read(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<Option<Outputs>, ProviderError> {
        let request = Request {
            name: ctx.name,
            provider: ctx.provider.map(|p| &p.arguments),
            id: Some(id),
            args: None,
            old_args: None,
        };
        let response = self.call("read", ctx, &request)?;
        if response.found == Some(false) {
            return Ok(None);
        }
        Ok(Some(response.outputs.unwrap_or_default()))
    }

    fn update(
        &self,
        ctx: &AdapterContext<'_>,
        id: &str,
        old: &Arguments,
        new: &Arguments,
    ) -> Result<Outputs, ProviderError> {
        let request = Request {
            name: ctx.name,
            provider: ctx.provider.map(|p| &p.arguments),
            id: Some(id),
            args: Some(new),
            old_args: Some(old),
        };
        Ok(self.call("update", ctx, &request)?.outputs.unwrap_or_default())
    }

    fn delete(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<(), ProviderError> {
        let request = Request {
            name: ctx.name,
            provider: ctx.provider.map(|p| &p.arguments),
            id: Some(id),
            args: None,
            old_args: None,
        };
        self.call("delete", ctx, &request).map(|_| ())
    }
}

/// Plugin part of a `<plugin>:<type>` kind
pub fn plugin_of(kind: &str) -> &str {
    kind.split_once(':').map_or(kind, |(plugin, _)| plugin)
}

/// Where plugin commands are found
#[derive(Debug, Clone, Default)]
pub struct PluginResolver {
    /// Commands declared by the stack file
    pub declared: BTreeMap<String, Vec<String>>,
    pub plugin_dir: Option<PathBuf>,
}

impl PluginResolver {
    /// Command line for a plugin: declared, then plugin directory, then `PATH`
    pub fn command(&self, plugin: &str) -> Vec<String> {
        if let Some(command) = self.declared.get(plugin) {
            return command.clone();
        }
        let executable = format!("{PLUGIN_PREFIX}{plugin}");
        let in_dir = self
            .plugin_dir
            .as_deref()
            .map(|dir| dir.join(&executable))
            .filter(|path| path.is_file());
        let program = in_dir.map_or(executable, |path| path_string(&path));
        vec![program]
    }

    /// Registry with an adapter for every kind, one adapter per plugin
    pub fn registry<'a>(
        &self,
        kinds: impl IntoIterator<Item = &'a str>,
        retry: &RetryConfig,
    ) -> AdapterRegistry {
        let kinds: BTreeSet<&str> = kinds.into_iter().collect();
        let mut adapters: BTreeMap<&str, Arc<dyn ProviderAdapter>> = BTreeMap::new();
        let mut registry = AdapterRegistry::new();
        for kind in kinds {
            let plugin = plugin_of(kind);
            let adapter = adapters
                .entry(plugin)
                .or_insert_with(|| {
                    let command = self.command(plugin);
                    log::debug!("Plugin {plugin} runs {}", command.join(" "));
                    Arc::new(ExecAdapter::new(command, retry.clone()))
                })
                .clone();
            registry.register_shared(kind, adapter);
        }
        registry
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
