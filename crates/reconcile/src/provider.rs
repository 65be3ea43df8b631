//! Provider adapter trait and registry
//!
//! A provider adapter performs the remote side effects for one or more
//! resource kinds. The engine only ever talks to adapters through
//! [`ProviderAdapter`] and treats every call as a black box: transient
//! failures are the adapter's to retry.

use crate::diff;
use crate::error::ProviderError;
use crate::value::{Arguments, Outputs};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Resolved configuration of a declared provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub arguments: Arguments,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, plugin: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            arguments,
        }
    }
}

/// What an adapter call is about
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext<'a> {
    /// Logical name of the resource
    pub name: &'a str,
    /// Kind of the resource
    pub kind: &'a str,
    /// Provider the resource is bound to; `None` means the default connection
    pub provider: Option<&'a ProviderConfig>,
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Identifier assigned by the provider
    pub id: String,
    pub outputs: Outputs,
}

impl Created {
    pub fn new(id: impl Into<String>, outputs: Outputs) -> Self {
        Self {
            id: id.into(),
            outputs,
        }
    }
}

/// Remote operations for a resource kind
///
/// # Example
///
/// ```ignore
/// struct Pools;
///
/// impl ProviderAdapter for Pools {
///     fn create(&self, ctx: &AdapterContext<'_>, args: &Arguments) -> Result<Created, ProviderError> {
///         let name = args["name"].as_str().unwrap_or(ctx.name);
///         Ok(Created::new(name, args.clone()))
///     }
///     // read, update, delete ...
/// }
/// ```
pub trait ProviderAdapter: Send + Sync {
    /// Create a new instance
    fn create(&self, ctx: &AdapterContext<'_>, args: &Arguments) -> Result<Created, ProviderError>;

    /// Fetch the current outputs of an instance, `None` if it no longer exists
    fn read(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<Option<Outputs>, ProviderError>;

    /// Change an instance in place
    fn update(
        &self,
        ctx: &AdapterContext<'_>,
        id: &str,
        old: &Arguments,
        new: &Arguments,
    ) -> Result<Outputs, ProviderError>;

    /// Remove an instance
    fn delete(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<(), ProviderError>;

    /// Field paths that differ between two argument sets
    ///
    /// Adapters may narrow this to ignore fields the remote side normalises.
    fn diff(&self, old: &Arguments, new: &Arguments) -> BTreeSet<String> {
        diff::changed_paths(old, new)
    }
}

/// Adapters keyed by resource kind, filled at process start
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter for one kind, replacing any previous one
    pub fn register(&mut self, kind: impl Into<String>, adapter: impl ProviderAdapter + 'static) {
        self.register_shared(kind, Arc::new(adapter));
    }

    /// Register an adapter instance that serves several kinds
    pub fn register_shared(&mut self, kind: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        let kind = kind.into();
        if self.adapters.insert(kind.clone(), adapter).is_some() {
            log::debug!("Replaced adapter for kind {kind}");
        }
    }

    pub fn with(mut self, kind: impl Into<String>, adapter: impl ProviderAdapter + 'static) -> Self {
        self.register(kind, adapter);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
