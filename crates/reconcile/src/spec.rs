//! Resource and provider declarations
//!
//! Declarations are immutable for the duration of a run. They are built by
//! the caller (a stack file, embedded code, an API) and handed to the engine.

use crate::error::DeclarationError;
use crate::value::{ParsePathError, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Per-resource policies applied when arguments change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyPolicy {
    /// Field paths (or `*`) whose change forces a replacement
    pub replace_on_change: BTreeSet<String>,
    /// Delete the old instance before creating its replacement
    pub delete_before_replace: bool,
}

/// Which provider configuration a resource is applied through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProviderBinding {
    /// The adapter's default connection
    #[default]
    Default,
    /// A declared provider, by logical name
    Named(String),
}

impl ProviderBinding {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Default => None,
            Self::Named(name) => Some(name),
        }
    }
}

/// One desired resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    /// Logical name, unique within a run
    pub name: String,
    /// Kind, used to select the provider adapter (e.g. "libvirt:volume")
    pub kind: String,
    pub args: BTreeMap<String, Value>,
    pub policy: ApplyPolicy,
    pub provider: ProviderBinding,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            args: BTreeMap::new(),
            policy: ApplyPolicy::default(),
            provider: ProviderBinding::Default,
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Argument referencing `<resource>.<path>` of another resource
    pub fn arg_ref(
        self,
        key: impl Into<String>,
        resource: &str,
        path: &str,
    ) -> Result<Self, ParsePathError> {
        Ok(self.arg(key, Value::reference(resource, path)?))
    }

    pub fn replace_on_change<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.policy
            .replace_on_change
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn delete_before_replace(mut self, enabled: bool) -> Self {
        self.policy.delete_before_replace = enabled;
        self
    }

    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = ProviderBinding::Named(name.into());
        self
    }

    /// Names of resources this declaration references, in argument-key order
    pub fn referenced_resources(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.args
            .values()
            .flat_map(Value::references)
            .map(|r| r.resource.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// A provider configuration other resources bind to
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSpec {
    pub name: String,
    /// Plugin implementing the provider (e.g. "libvirt")
    pub plugin: String,
    /// Connection arguments; may reference resource outputs
    pub args: BTreeMap<String, Value>,
}

impl ProviderSpec {
    pub fn new(name: impl Into<String>, plugin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin: plugin.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    /// Names of resources the connection arguments reference, in argument-key order
    pub fn referenced_resources(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.args
            .values()
            .flat_map(Value::references)
            .map(|r| r.resource.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }
}

/// The full declaration set of a run, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Declarations {
    pub providers: Vec<ProviderSpec>,
    pub resources: Vec<ResourceSpec>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: ProviderSpec) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_resource(mut self, resource: ResourceSpec) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Remove a resource by name, returning it
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceSpec> {
        let pos = self.resources.iter().position(|r| r.name == name)?;
        Some(self.resources.remove(pos))
    }

    /// Check that every logical name is used once across providers and resources
    pub fn check_unique_names(&self) -> Result<(), DeclarationError> {
        let mut seen = HashSet::new();
        let names = self
            .providers
            .iter()
            .map(|p| &p.name)
            .chain(self.resources.iter().map(|r| &r.name));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(DeclarationError::DuplicateName(name.clone()));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty() && self.resources.is_empty()
    }
}
