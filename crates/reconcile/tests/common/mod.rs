//! Shared fixtures: a recording in-memory provider and the VM declaration set

#![allow(dead_code)]

use reconcile::{
    AdapterContext, AdapterRegistry, Arguments, Created, Declarations, Engine, EngineOptions,
    MemoryBackend, OperationKind, Outputs, ProviderAdapter, ProviderError, ProviderSpec,
    ResourceSpec, StateStore, Value,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const KINDS: [&str; 5] = [
    "libvirt:pool",
    "libvirt:volume",
    "libvirt:network",
    "libvirt:cloudinit",
    "libvirt:domain",
];

/// Provider call boundary as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(OperationKind, String),
    End(OperationKind, String),
}

type Hook = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
    events: Mutex<Vec<Event>>,
    /// Provider id → (logical name, outputs)
    instances: Mutex<HashMap<String, (String, Outputs)>>,
    deleted: Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
    failures: Mutex<HashSet<(OperationKind, String)>>,
    delay: Mutex<Duration>,
    on_create: Mutex<Option<Hook>>,
}

/// In-memory provider recording every call
#[derive(Clone, Default)]
pub struct MockProvider {
    inner: Arc<Inner>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for kind in KINDS {
            registry.register(kind, self.clone());
        }
        registry
    }

    /// Make `operation` on `name` fail until cleared
    pub fn fail(&self, operation: OperationKind, name: &str) {
        self.inner
            .failures
            .lock()
            .unwrap()
            .insert((operation, name.to_string()));
    }

    pub fn clear_failures(&self) {
        self.inner.failures.lock().unwrap().clear();
    }

    /// Sleep inside every call, to widen concurrency windows
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }

    /// Run `hook` with the logical name after every successful create
    pub fn on_create(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.inner.on_create.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.inner.events.lock().unwrap().clear();
    }

    /// Names whose `operation` was started, in call order
    pub fn started(&self, operation: OperationKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Start(op, name) if op == operation => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Position of an event in the log
    pub fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event:?} not recorded"))
    }

    /// (name, id) of every delete that reached the provider
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.inner.deleted.lock().unwrap().clone()
    }

    pub fn live_ids(&self) -> HashSet<String> {
        self.inner.instances.lock().unwrap().keys().cloned().collect()
    }

    /// Remove an instance behind the engine's back
    pub fn forget(&self, id: &str) {
        self.inner.instances.lock().unwrap().remove(id);
    }

    /// Change one reported output behind the engine's back
    pub fn set_output(&self, id: &str, key: &str, value: serde_json::Value) {
        if let Some((_, outputs)) = self.inner.instances.lock().unwrap().get_mut(id) {
            outputs.insert(key.to_string(), value);
        }
    }

    fn begin(&self, operation: OperationKind, name: &str) -> Result<(), ProviderError> {
        self.record(Event::Start(operation, name.to_string()));
        let delay = *self.inner.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let failing = self
            .inner
            .failures
            .lock()
            .unwrap()
            .contains(&(operation, name.to_string()));
        if failing {
            self.record(Event::End(operation, name.to_string()));
            return Err(ProviderError::Remote(format!("injected {operation} failure")));
        }
        Ok(())
    }

    fn record(&self, event: Event) {
        self.inner.events.lock().unwrap().push(event);
    }

    fn outputs(ctx: &AdapterContext<'_>, args: &Arguments) -> Outputs {
        let mut outputs = args.clone();
        outputs
            .entry("name")
            .or_insert_with(|| json!(ctx.name));
        if ctx.kind == "libvirt:domain" {
            outputs.insert(
                "network_interfaces".into(),
                json!([{ "addresses": ["192.168.10.52"] }]),
            );
        }
        outputs
    }
}

impl ProviderAdapter for MockProvider {
    fn create(&self, ctx: &AdapterContext<'_>, args: &Arguments) -> Result<Created, ProviderError> {
        self.begin(OperationKind::Create, ctx.name)?;
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{n}", ctx.name);
        let outputs = Self::outputs(ctx, args);
        self.inner
            .instances
            .lock()
            .unwrap()
            .insert(id.clone(), (ctx.name.to_string(), outputs.clone()));
        if let Some(hook) = self.inner.on_create.lock().unwrap().as_ref() {
            hook(ctx.name);
        }
        self.record(Event::End(OperationKind::Create, ctx.name.to_string()));
        Ok(Created::new(id, outputs))
    }

    fn read(&self, _ctx: &AdapterContext<'_>, id: &str) -> Result<Option<Outputs>, ProviderError> {
        Ok(self
            .inner
            .instances
            .lock()
            .unwrap()
            .get(id)
            .map(|(_, outputs)| outputs.clone()))
    }

    fn update(
        &self,
        ctx: &AdapterContext<'_>,
        id: &str,
        _old: &Arguments,
        new: &Arguments,
    ) -> Result<Outputs, ProviderError> {
        self.begin(OperationKind::Update, ctx.name)?;
        let outputs = Self::outputs(ctx, new);
        self.inner
            .instances
            .lock()
            .unwrap()
            .insert(id.to_string(), (ctx.name.to_string(), outputs.clone()));
        self.record(Event::End(OperationKind::Update, ctx.name.to_string()));
        Ok(outputs)
    }

    fn delete(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<(), ProviderError> {
        self.begin(OperationKind::Delete, ctx.name)?;
        self.inner.instances.lock().unwrap().remove(id);
        self.inner
            .deleted
            .lock()
            .unwrap()
            .push((ctx.name.to_string(), id.to_string()));
        self.record(Event::End(OperationKind::Delete, ctx.name.to_string()));
        Ok(())
    }
}

/// Engine over a fresh in-memory store
pub fn engine(mock: &MockProvider, jobs: usize) -> (Engine, MemoryBackend) {
    let backend = MemoryBackend::new();
    let engine = Engine::new(mock.registry(), StateStore::new(backend.clone())).with_options(
        EngineOptions {
            jobs,
            ..EngineOptions::default()
        },
    );
    (engine, backend)
}

/// Pool P, volume V1 → P, volume V2 → V1, network N, domain D → V2, N
pub fn scenario() -> Declarations {
    Declarations::new()
        .with_provider(
            ProviderSpec::new("provider", "libvirt").arg("uri", Value::literal("qemu:///system")),
        )
        .with_resource(
            ResourceSpec::new("pool", "libvirt:pool")
                .provider("provider")
                .arg("type", Value::literal("dir"))
                .arg("path", Value::literal("/pool/cluster_storage")),
        )
        .with_resource(
            ResourceSpec::new("v1", "libvirt:volume")
                .arg_ref("pool", "pool", "name")
                .unwrap()
                .arg("source", Value::literal("ubuntu-22.04.qcow2")),
        )
        .with_resource(
            ResourceSpec::new("v2", "libvirt:volume")
                .arg_ref("pool", "pool", "name")
                .unwrap()
                .arg_ref("base_volume_id", "v1", "id")
                .unwrap()
                .arg("size", Value::literal(10_737_418_240_u64)),
        )
        .with_resource(
            ResourceSpec::new("net", "libvirt:network")
                .arg("mode", Value::literal("nat"))
                .arg("addresses", Value::literal(json!(["192.168.10.0/24"]))),
        )
        .with_resource(
            ResourceSpec::new("domain", "libvirt:domain")
                .arg("memory", Value::literal(2048))
                .arg(
                    "disks",
                    Value::List(vec![Value::Map(
                        [("volume_id".to_string(), Value::reference("v2", "id").unwrap())]
                            .into_iter()
                            .collect(),
                    )]),
                )
                .arg_ref("network_id", "net", "id")
                .unwrap(),
        )
}

/// Replace one resource declaration, keeping its position
pub fn replace_resource(decls: &mut Declarations, spec: ResourceSpec) {
    let slot = decls
        .resources
        .iter_mut()
        .find(|r| r.name == spec.name)
        .unwrap();
    *slot = spec;
}
