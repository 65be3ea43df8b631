//! Stack files: providers, resources and outputs declared in TOML
//!
//! ```toml
//! [config]
//! libvirt_uri = {}                      # required, set with -c
//!
//! [providers.provider]
//! plugin = "libvirt"
//! uri = { config = "libvirt_uri" }
//!
//! [resources.cluster]
//! kind = "libvirt:pool"
//! provider = "provider"
//! args = { type = "dir", path = "/pool/cluster_storage" }
//!
//! [resources.filesystem.args]
//! base_volume_id = { ref = "ubuntu-image.id" }
//!
//! [outputs]
//! "VM name" = "ubuntu.name"
//! ```
//!
//! Inline tables with a single `ref`, `file` or `config` key are special;
//! everything else is a literal. Declaration order is file order.

use anyhow::{Context, Result, bail};
use reconcile::{Declarations, Json, OutputRef, OutputSpec, ProviderSpec, ResourceSpec, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A loaded stack file
#[derive(Debug, Clone)]
pub struct Stack {
    pub path: PathBuf,
    pub declarations: Declarations,
    pub outputs: Vec<OutputSpec>,
    /// Plugin name → command line
    pub plugins: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StackFile {
    #[serde(default)]
    config: toml::Table,
    #[serde(default)]
    plugins: toml::Table,
    #[serde(default)]
    providers: toml::Table,
    #[serde(default)]
    resources: toml::Table,
    #[serde(default)]
    outputs: toml::Table,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceEntry {
    kind: String,
    provider: Option<String>,
    #[serde(default)]
    args: toml::Table,
    #[serde(default)]
    policy: PolicyEntry,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyEntry {
    #[serde(default)]
    replace_on_change: Vec<String>,
    #[serde(default)]
    delete_before_replace: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PluginEntry {
    Program(String),
    Command(Vec<String>),
}

impl Stack {
    /// Load a stack file, applying `-c key=value` overrides
    pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Could not read stack file: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&content, base, overrides)
            .with_context(|| format!("Invalid stack file: {}", path.display()))
            .map(|stack| Self {
                path: path.to_path_buf(),
                ..stack
            })
    }

    /// Parse stack TOML, resolving relative paths against `base`
    pub fn parse(content: &str, base: &Path, overrides: &[(String, String)]) -> Result<Self> {
        let file: StackFile = toml::from_str(content)?;
        let loader = Loader {
            base,
            config: stack_config(&file.config, overrides)?,
        };

        let mut declarations = Declarations::new();
        for (name, entry) in &file.providers {
            let table = entry
                .as_table()
                .with_context(|| format!("provider `{name}` must be a table"))?;
            let plugin = table
                .get("plugin")
                .and_then(toml::Value::as_str)
                .with_context(|| format!("provider `{name}` needs a `plugin`"))?;
            let mut spec = ProviderSpec::new(name, plugin);
            for (key, value) in table.iter().filter(|(k, _)| *k != "plugin") {
                let value = loader
                    .value(value)
                    .with_context(|| format!("provider `{name}`, argument `{key}`"))?;
                spec = spec.arg(key, value);
            }
            declarations = declarations.with_provider(spec);
        }

        for (name, entry) in file.resources {
            let entry: ResourceEntry = entry
                .try_into()
                .with_context(|| format!("resource `{name}`"))?;
            let mut spec = ResourceSpec::new(&name, &entry.kind)
                .replace_on_change(entry.policy.replace_on_change)
                .delete_before_replace(entry.policy.delete_before_replace);
            if let Some(provider) = entry.provider {
                spec = spec.provider(provider);
            }
            for (key, value) in &entry.args {
                let value = loader
                    .value(value)
                    .with_context(|| format!("resource `{name}`, argument `{key}`"))?;
                spec = spec.arg(key, value);
            }
            declarations = declarations.with_resource(spec);
        }

        let mut outputs = Vec::new();
        for (name, value) in &file.outputs {
            let expression = value
                .as_str()
                .with_context(|| format!("output `{name}` must be a string like \"resource.path\""))?;
            let reference: OutputRef = expression
                .parse()
                .with_context(|| format!("output `{name}`"))?;
            outputs.push(OutputSpec::new(name, reference));
        }

        let mut plugins = BTreeMap::new();
        for (name, entry) in file.plugins {
            let entry: PluginEntry = entry
                .try_into()
                .with_context(|| format!("plugin `{name}` must be a path or a command array"))?;
            let mut command = match entry {
                PluginEntry::Program(program) => vec![program],
                PluginEntry::Command(command) => command,
            };
            let Some(program) = command.first_mut() else {
                bail!("plugin `{name}` has an empty command");
            };
            if program.contains('/') {
                *program = base.join(crate::config::expand(program)).to_string_lossy().into_owned();
            }
            plugins.insert(name, command);
        }

        Ok(Self {
            path: base.join("stack.toml"),
            declarations,
            outputs,
            plugins,
        })
    }
}

/// Declared config with overrides; `None` marks a required key left unset
fn stack_config(
    declared: &toml::Table,
    overrides: &[(String, String)],
) -> Result<BTreeMap<String, Option<Json>>> {
    let mut config = BTreeMap::new();
    for (key, value) in declared {
        let default = match value {
            toml::Value::Table(t) if t.is_empty() => None,
            other => Some(literal(other)),
        };
        config.insert(key.clone(), default);
    }
    for (key, value) in overrides {
        if !config.contains_key(key) {
            log::warn!("Config key `{key}` is not declared by the stack");
        }
        config.insert(key.clone(), Some(Json::String(value.clone())));
    }
    Ok(config)
}

struct Loader<'a> {
    base: &'a Path,
    config: BTreeMap<String, Option<Json>>,
}

impl Loader<'_> {
    fn value(&self, value: &toml::Value) -> Result<Value> {
        match value {
            toml::Value::Table(table) => {
                let mut entries = table.iter();
                match (entries.next(), entries.next()) {
                    (Some((key, inner)), None) => self.single(key, inner, table),
                    _ => self.map(table),
                }
            }
            toml::Value::Array(items) => items
                .iter()
                .map(|item| self.value(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            other => Ok(Value::literal(literal(other))),
        }
    }

    /// A one-entry table: `ref`, `file`, `config` or a plain map
    fn single(&self, key: &str, inner: &toml::Value, table: &toml::Table) -> Result<Value> {
        match (key, inner.as_str()) {
            ("ref", Some(expression)) => {
                let reference: OutputRef = expression
                    .parse()
                    .with_context(|| format!("invalid reference `{expression}`"))?;
                Ok(Value::OutputRef(reference))
            }
            ("file", Some(path)) => {
                let path = self.base.join(crate::config::expand(path));
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("Could not read {}", path.display()))?;
                Ok(Value::literal(content))
            }
            ("config", Some(name)) => match self.config.get(name) {
                Some(Some(value)) => Ok(Value::literal(value.clone())),
                Some(None) => bail!("config `{name}` is required (pass -c {name}=...)"),
                None => bail!("config `{name}` is not declared in [config]"),
            },
            ("ref" | "file" | "config", None) => bail!("`{key}` expects a string"),
            _ => self.map(table),
        }
    }

    fn map(&self, table: &toml::Table) -> Result<Value> {
        table
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.value(v)?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Value::Map)
    }
}

/// Plain JSON for a TOML value; datetimes become strings
fn literal(value: &toml::Value) -> Json {
    match value {
        toml::Value::String(s) => Json::String(s.clone()),
        toml::Value::Integer(i) => Json::from(*i),
        toml::Value::Float(f) => Json::from(*f),
        toml::Value::Boolean(b) => Json::Bool(*b),
        toml::Value::Datetime(dt) => Json::String(dt.to_string()),
        toml::Value::Array(items) => Json::Array(items.iter().map(literal).collect()),
        toml::Value::Table(table) => Json::Object(
            table
                .iter()
                .map(|(k, v)| (k.clone(), literal(v)))
                .collect(),
        ),
    }
}

/// Parse a `key=value` command-line pair
pub fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    const STACK: &str = r#"
[config]
libvirt_uri = {}
memory = 2048

[plugins]
libvirt = "./plugins/libvirt"

[providers.provider]
plugin = "libvirt"
uri = { config = "libvirt_uri" }

[resources.cluster]
kind = "libvirt:pool"
provider = "provider"
args = { type = "dir", path = "/pool/cluster_storage" }

[resources.network]
kind = "libvirt:network"
provider = "provider"
args = { addresses = ["192.168.10.0/24"], mode = "nat", autostart = true }

[resources.filesystem]
kind = "libvirt:volume"
provider = "provider"
[resources.filesystem.args]
pool = { ref = "cluster.name" }
size = 10000000000

[resources.ubuntu]
kind = "libvirt:domain"
provider = "provider"
policy = { replace_on_change = ["*"], delete_before_replace = true }
[resources.ubuntu.args]
memory = { config = "memory" }
disks = [{ volume_id = { ref = "filesystem.id" } }]

[outputs]
"IP Address" = "ubuntu.network_interfaces[0].addresses[0]"
"VM name" = "ubuntu.name"
"#;

    fn overrides() -> Vec<(String, String)> {
        vec![("libvirt_uri".into(), "qemu:///system".into())]
    }

    #[test]
    fn test_parse_keeps_file_order() {
        let stack = Stack::parse(STACK, Path::new("/stacks/vm"), &overrides()).unwrap();
        let names: Vec<&str> = stack
            .declarations
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["cluster", "network", "filesystem", "ubuntu"]);
        assert_eq!(stack.outputs[0].name, "IP Address");
        assert_eq!(
            stack.plugins["libvirt"],
            vec!["/stacks/vm/./plugins/libvirt".to_string()]
        );
    }

    #[test]
    fn test_references_policies_and_config() {
        let stack = Stack::parse(STACK, Path::new("."), &overrides()).unwrap();
        let decls = &stack.declarations;

        let provider = decls.provider("provider").unwrap();
        assert_eq!(provider.plugin, "libvirt");
        assert_eq!(provider.args["uri"], Value::literal("qemu:///system"));

        let filesystem = decls.resource("filesystem").unwrap();
        assert_eq!(filesystem.referenced_resources(), vec!["cluster"]);
        assert_eq!(filesystem.args["size"], Value::literal(10_000_000_000_i64));

        let ubuntu = decls.resource("ubuntu").unwrap();
        assert!(ubuntu.policy.delete_before_replace);
        assert!(ubuntu.policy.replace_on_change.contains("*"));
        assert_eq!(ubuntu.args["memory"], Value::literal(2048));
        assert_eq!(ubuntu.referenced_resources(), vec!["filesystem"]);
        assert_eq!(ubuntu.provider.name(), Some("provider"));

        let network = decls.resource("network").unwrap();
        assert_eq!(
            network.args["addresses"],
            Value::List(vec![Value::literal("192.168.10.0/24")])
        );
    }

    #[test]
    fn test_required_config_missing() {
        let err = Stack::parse(STACK, Path::new("."), &[]).unwrap_err();
        assert!(format!("{err:#}").contains("config `libvirt_uri` is required"));
    }

    #[test]
    fn test_file_values_read_relative_to_stack() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("user_data.yaml"), "#cloud-config\n").unwrap();
        let stack = Stack::parse(
            r#"
[resources.cloud-init]
kind = "libvirt:cloudinit"
args = { user_data = { file = "user_data.yaml" } }
"#,
            dir.path(),
            &[],
        )
        .unwrap();
        let spec = stack.declarations.resource("cloud-init").unwrap();
        assert_eq!(spec.args["user_data"], Value::literal(json!("#cloud-config\n")));

        let missing = Stack::parse(
            "[resources.x]\nkind = \"k\"\nargs = { a = { file = \"nope.yaml\" } }\n",
            dir.path(),
            &[],
        );
        assert!(missing.is_err());
    }

    #[test]
    fn test_malformed_entries_rejected() {
        let no_kind = "[resources.x]\nargs = {}\n";
        assert!(Stack::parse(no_kind, Path::new("."), &[]).is_err());

        let bad_output = "[outputs]\nip = \"nodot\"\n";
        assert!(Stack::parse(bad_output, Path::new("."), &[]).is_err());

        let bad_ref = "[resources.x]\nkind = \"k\"\nargs = { a = { ref = 3 } }\n";
        assert!(Stack::parse(bad_ref, Path::new("."), &[]).is_err());
    }

    #[test]
    fn test_ubuntu_demo_stack_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/ubuntu-vm/stack.toml");
        let stack = Stack::load(&path, &overrides()).unwrap();
        assert_eq!(stack.path, path);

        let decls = &stack.declarations;
        assert_eq!(decls.resources.len(), 6);
        decls.check_unique_names().unwrap();

        let ubuntu = decls.resource("ubuntu").unwrap();
        assert_eq!(
            ubuntu.referenced_resources(),
            vec!["cloud-init", "filesystem", "network"]
        );
        let cloud_init = decls.resource("cloud-init").unwrap();
        assert_eq!(cloud_init.args["meta_data"], cloud_init.args["user_data"]);

        let graph = reconcile::ReferenceGraph::build(decls).unwrap();
        let order = graph.ordered_names();
        let position = |name: &str| order.iter().position(|n| *n == name).unwrap();
        assert!(position("cluster") < position("ubuntu-image"));
        assert!(position("ubuntu-image") < position("filesystem"));
        assert!(position("filesystem") < position("ubuntu"));
        assert!(position("network") < position("ubuntu"));

        let outputs: Vec<&str> = stack.outputs.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(outputs, vec!["IP Address", "VM name"]);
    }

    #[test]
    fn test_parse_key_val() {
        assert_eq!(
            parse_key_val("libvirt_uri=qemu:///system"),
            Ok(("libvirt_uri".into(), "qemu:///system".into()))
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }
}
