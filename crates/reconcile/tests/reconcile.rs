//! End-to-end runs of the engine against a recording provider

mod common;

use common::{Event, MockProvider, engine, replace_resource, scenario};
use reconcile::{
    AdapterRegistry, DeclarationError, Engine, EngineOptions, Error, FileBackend, MemoryBackend,
    OperationKind, OutputSpec, PendingOperation, ProviderError, ReplaceCleanup, ResourceSpec,
    ResourceState, StateStore, StateStoreError, Value,
};
use serde_json::json;
use std::time::Duration;

use OperationKind::{Create, Delete, Update};

fn start(op: OperationKind, name: &str) -> Event {
    Event::Start(op, name.to_string())
}

fn end(op: OperationKind, name: &str) -> Event {
    Event::End(op, name.to_string())
}

fn resize_v2(size: u64) -> ResourceSpec {
    ResourceSpec::new("v2", "libvirt:volume")
        .arg_ref("pool", "pool", "name")
        .unwrap()
        .arg_ref("base_volume_id", "v1", "id")
        .unwrap()
        .arg("size", Value::literal(size))
}

#[test]
fn test_apply_respects_reference_order() {
    let mock = MockProvider::new();
    mock.set_delay(Duration::from_millis(5));
    let (engine, _) = engine(&mock, 4);

    let result = engine.apply(&scenario(), &[]).unwrap();
    assert!(result.is_success(), "{:?}", result.failed);
    assert_eq!(result.completed.len(), 5);

    for (producer, consumer) in [
        ("pool", "v1"),
        ("pool", "v2"),
        ("v1", "v2"),
        ("v2", "domain"),
        ("net", "domain"),
    ] {
        assert!(
            mock.position(&end(Create, producer)) < mock.position(&start(Create, consumer)),
            "{consumer} started before {producer} finished"
        );
    }

    let stored = engine.store().snapshot();
    let domain = stored.get("domain").unwrap();
    assert_eq!(domain.dependencies, vec!["v2".to_string(), "net".to_string()]);
    assert_eq!(
        domain.arguments["network_id"],
        json!(stored.get("net").unwrap().provider_id)
    );
    assert!(stored.pending.is_empty());
    assert!(stored.providers.contains_key("provider"));
}

#[test]
fn test_rerun_without_changes_is_noop() {
    let mock = MockProvider::new();
    let (engine, backend) = engine(&mock, 2);
    engine.apply(&scenario(), &[]).unwrap();
    mock.clear_events();
    let writes = backend.write_count();

    let result = engine.apply(&scenario(), &[]).unwrap();
    assert!(result.is_success());
    assert!(mock.events().is_empty());
    assert!(
        result
            .operations
            .iter()
            .all(|r| r.operation == OperationKind::NoOp)
    );
    assert_eq!(result.summary().unchanged, 5);
    assert_eq!(backend.write_count(), writes);
}

#[test]
fn test_changed_argument_updates_in_place() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();
    let id = engine.store().get("v2").unwrap().provider_id;
    mock.clear_events();

    replace_resource(&mut decls, resize_v2(21_474_836_480));
    let result = engine.apply(&decls, &[]).unwrap();

    assert!(result.is_success());
    assert_eq!(mock.started(Update), vec!["v2"]);
    assert!(mock.started(Create).is_empty());
    let v2 = engine.store().get("v2").unwrap();
    assert_eq!(v2.provider_id, id);
    assert_eq!(v2.arguments["size"], json!(21_474_836_480_u64));
}

#[test]
fn test_replace_on_change_creates_first_and_cleans_up_after_dependents() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();
    let old_id = engine.store().get("v1").unwrap().provider_id;
    mock.clear_events();

    replace_resource(
        &mut decls,
        ResourceSpec::new("v1", "libvirt:volume")
            .arg_ref("pool", "pool", "name")
            .unwrap()
            .arg("source", Value::literal("ubuntu-24.04.qcow2"))
            .replace_on_change(["source"]),
    );
    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success(), "{:?}", result.failed);

    let new_id = engine.store().get("v1").unwrap().provider_id;
    assert_ne!(new_id, old_id);
    // v2 follows the new identifier, the domain does not see v1 at all
    assert_eq!(mock.started(Update), vec!["v2"]);
    assert_eq!(
        engine.store().get("v2").unwrap().arguments["base_volume_id"],
        json!(new_id)
    );
    assert_eq!(mock.deleted(), vec![("v1".to_string(), old_id)]);
    assert!(mock.position(&start(Create, "v1")) < mock.position(&start(Delete, "v1")));
    assert!(mock.position(&end(Update, "v2")) < mock.position(&start(Delete, "v1")));
    assert!(engine.store().snapshot().retired.is_empty());
}

#[test]
fn test_immediate_cleanup_deletes_inside_replace() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let engine = engine.with_options(EngineOptions {
        jobs: 1,
        replace_cleanup: ReplaceCleanup::Immediate,
    });
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();
    mock.clear_events();

    replace_resource(
        &mut decls,
        ResourceSpec::new("v1", "libvirt:volume")
            .arg_ref("pool", "pool", "name")
            .unwrap()
            .arg("source", Value::literal("ubuntu-24.04.qcow2"))
            .replace_on_change(["*"]),
    );
    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success());
    assert!(mock.position(&end(Delete, "v1")) < mock.position(&start(Update, "v2")));
    assert!(engine.store().snapshot().retired.is_empty());
}

#[test]
fn test_delete_before_replace_ordering() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    let domain = |memory: u64, delete_first: bool| {
        ResourceSpec::new("domain", "libvirt:domain")
            .arg("memory", Value::literal(memory))
            .arg_ref("network_id", "net", "id")
            .unwrap()
            .replace_on_change(["*"])
            .delete_before_replace(delete_first)
    };
    replace_resource(&mut decls, domain(2048, true));
    engine.apply(&decls, &[]).unwrap();
    mock.clear_events();

    replace_resource(&mut decls, domain(4096, true));
    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success());
    assert!(mock.position(&end(Delete, "domain")) < mock.position(&start(Create, "domain")));
    mock.clear_events();

    replace_resource(&mut decls, domain(8192, false));
    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success());
    assert!(mock.position(&start(Create, "domain")) < mock.position(&start(Delete, "domain")));
}

#[test]
fn test_failure_partitions_resources_and_run_resumes() {
    let mock = MockProvider::new();
    mock.fail(Create, "v2");
    let (engine, _) = engine(&mock, 1);

    let result = engine.apply(&scenario(), &[]).unwrap();
    assert!(!result.is_success());
    let failed = result.failed.as_ref().unwrap();
    assert_eq!(failed.name, "v2");
    assert_eq!(failed.operation, Create);
    assert_eq!(result.completed, vec!["pool", "v1"]);
    assert_eq!(result.skipped, vec!["net", "domain"]);
    assert!(result.outputs.is_empty());

    let stored = engine.store().snapshot();
    assert!(stored.get("v2").is_none());
    assert!(stored.pending.is_empty());

    mock.clear_failures();
    mock.clear_events();
    let result = engine.apply(&scenario(), &[]).unwrap();
    assert!(result.is_success());
    let mut created = mock.started(Create);
    created.sort();
    assert_eq!(created, vec!["domain", "net", "v2"]);
}

#[test]
fn test_orphan_deleted_once_after_dependent_update() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 2);
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();
    let net_id = engine.store().get("net").unwrap().provider_id;
    mock.clear_events();

    decls.remove_resource("net");
    replace_resource(
        &mut decls,
        ResourceSpec::new("domain", "libvirt:domain")
            .arg("memory", Value::literal(2048))
            .arg(
                "disks",
                Value::List(vec![Value::Map(
                    [("volume_id".to_string(), Value::reference("v2", "id").unwrap())]
                        .into_iter()
                        .collect(),
                )]),
            ),
    );
    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success(), "{:?}", result.failed);

    assert_eq!(mock.deleted(), vec![("net".to_string(), net_id)]);
    assert!(mock.position(&end(Update, "domain")) < mock.position(&start(Delete, "net")));
    assert!(engine.store().get("net").is_none());
    assert!(result.completed.contains(&"net".to_string()));
}

#[test]
fn test_orphans_skipped_when_apply_fails() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();

    decls.remove_resource("domain");
    replace_resource(&mut decls, resize_v2(1));
    mock.fail(Update, "v2");
    let result = engine.apply(&decls, &[]).unwrap();

    assert!(!result.is_success());
    assert!(mock.deleted().is_empty());
    assert!(result.skipped.contains(&"domain".to_string()));
    assert!(engine.store().get("domain").is_some());
}

#[test]
fn test_missing_attribute_fails_consumer() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    replace_resource(
        &mut decls,
        ResourceSpec::new("v1", "libvirt:volume")
            .arg_ref("pool", "pool", "capacity")
            .unwrap(),
    );

    let result = engine.apply(&decls, &[]).unwrap();
    let failed = result.failed.unwrap();
    assert_eq!(failed.name, "v1");
    assert!(matches!(
        failed.error,
        Error::Provider {
            source: ProviderError::MissingAttribute { ref resource, .. },
            ..
        } if resource == "pool"
    ));
    assert!(mock.started(Create).iter().all(|n| n != "v1"));
}

#[test]
fn test_kind_change_replaces() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let mut decls = scenario();
    engine.apply(&decls, &[]).unwrap();
    let old_id = engine.store().get("net").unwrap().provider_id;

    replace_resource(
        &mut decls,
        ResourceSpec::new("net", "libvirt:cloudinit")
            .arg("mode", Value::literal("nat"))
            .arg("addresses", Value::literal(json!(["192.168.10.0/24"]))),
    );
    let plan = engine.preview(&decls).unwrap();
    assert_eq!(plan.get("net").unwrap().operation, OperationKind::Replace);
    assert_eq!(plan.get("net").unwrap().replacing, vec!["kind"]);

    let result = engine.apply(&decls, &[]).unwrap();
    assert!(result.is_success());
    assert_eq!(engine.store().get("net").unwrap().kind, "libvirt:cloudinit");
    assert!(mock.deleted().contains(&("net".to_string(), old_id)));
}

#[test]
fn test_declaration_errors_have_no_side_effects() {
    let mock = MockProvider::new();
    let (engine, backend) = engine(&mock, 2);

    let unknown = scenario().with_resource(ResourceSpec::new("vpc", "aws:vpc"));
    let err = engine.apply(&unknown, &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Declaration(DeclarationError::UnknownKind { ref kind, .. }) if kind == "aws:vpc"
    ));

    let cyclic = scenario().with_resource(
        ResourceSpec::new("a", "libvirt:pool")
            .arg_ref("x", "b", "id")
            .unwrap(),
    )
    .with_resource(
        ResourceSpec::new("b", "libvirt:pool")
            .arg_ref("x", "a", "id")
            .unwrap(),
    );
    let err = engine.apply(&cyclic, &[]).unwrap_err();
    assert!(err.is_declaration());
    let names = err.logical_names();
    assert!(names.contains(&"a") && names.contains(&"b"));

    assert!(mock.events().is_empty());
    assert_eq!(backend.write_count(), 0);
    assert!(!backend.is_locked());
}

#[test]
fn test_lock_held_elsewhere_rejects_apply() {
    let mock = MockProvider::new();
    let (engine, _) = engine(&mock, 1);
    let held = engine.store().lock("other").unwrap();

    let err = engine.apply(&scenario(), &[]).unwrap_err();
    assert!(matches!(err, Error::StateStore(StateStoreError::Locked { .. })));
    assert!(mock.events().is_empty());

    held.release();
    assert!(engine.apply(&scenario(), &[]).unwrap().is_success());
}

#[test]
fn test_failed_state_write_is_uncommitted_and_repaired() {
    let mock = MockProvider::new();
    let (engine, backend) = engine(&mock, 1);
    let hook_backend = backend.clone();
    mock.on_create(move |name| {
        if name == "v1" {
            hook_backend.set_fail_writes(true);
        }
    });

    let result = engine.apply(&scenario(), &[]).unwrap();
    assert_eq!(result.uncommitted, vec!["v1"]);
    assert!(matches!(
        result.failed.as_ref().map(|f| &f.error),
        Some(Error::StateStore(_))
    ));
    let stored = backend.stored().unwrap();
    assert!(stored.get("v1").is_none());
    assert_eq!(stored.pending["v1"].operation, Create);

    mock.on_create(|_| {});
    backend.set_fail_writes(false);
    let result = engine.apply(&scenario(), &[]).unwrap();
    assert!(result.is_success(), "{:?}", result.failed);
    let stored = backend.stored().unwrap();
    assert!(stored.pending.is_empty());
    assert_eq!(stored.resources.len(), 5);
}

/// Engine over an applied scenario, with the provider id of `name`
fn applied(mock: &MockProvider, name: &str) -> (Engine, MemoryBackend, String) {
    let (engine, backend) = engine(mock, 1);
    assert!(engine.apply(&scenario(), &[]).unwrap().is_success());
    let id = engine.store().get(name).unwrap().provider_id;
    (engine, backend, id)
}

fn interrupt(engine: &Engine, name: &str, operation: OperationKind, kind: &str, id: &str) {
    engine
        .store()
        .mark_pending(name, PendingOperation::new(operation, kind, Some(id.to_string())))
        .unwrap();
}

#[test]
fn test_repair_refreshes_tracked_instance() {
    let mock = MockProvider::new();
    let (engine, backend, id) = applied(&mock, "domain");
    interrupt(&engine, "domain", Update, "libvirt:domain", &id);
    mock.set_output(&id, "memory", json!(4096));

    let report = engine.refresh().unwrap();
    // Repair stored the new outputs before the refresh pass ran.
    assert!(report.updated.is_empty());
    assert!(report.unchanged.contains(&"domain".to_string()));
    let stored = backend.stored().unwrap();
    assert_eq!(stored.get("domain").unwrap().provider_id, id);
    assert_eq!(stored.get("domain").unwrap().outputs["memory"], json!(4096));
    assert!(stored.pending.is_empty());
}

#[test]
fn test_repair_drops_tracked_instance_that_is_gone() {
    let mock = MockProvider::new();
    let (engine, backend, id) = applied(&mock, "domain");
    interrupt(&engine, "domain", Update, "libvirt:domain", &id);
    mock.forget(&id);

    let report = engine.refresh().unwrap();
    assert!(report.removed.is_empty());
    let stored = backend.stored().unwrap();
    assert!(stored.get("domain").is_none());
    assert!(stored.pending.is_empty());
    assert_eq!(stored.resources.len(), 4);
}

#[test]
fn test_repair_drops_retired_instance_that_is_gone() {
    let mock = MockProvider::new();
    let (engine, backend, _) = applied(&mock, "net");
    let current = engine.store().get("net").unwrap();
    let retired = ResourceState {
        provider_id: "net-retired".to_string(),
        ..current.clone()
    };
    engine.store().put_replacing(current, retired).unwrap();
    interrupt(&engine, "net", Delete, "libvirt:network", "net-retired");

    engine.refresh().unwrap();
    let stored = backend.stored().unwrap();
    assert!(stored.retired.is_empty());
    assert!(stored.pending.is_empty());
    assert!(stored.get("net").is_some());
    assert!(mock.deleted().is_empty());
}

#[test]
fn test_repair_clears_marker_of_untracked_instance() {
    let mock = MockProvider::new();
    let (engine, backend, id) = applied(&mock, "domain");
    engine.store().remove("domain").unwrap();
    interrupt(&engine, "domain", Create, "libvirt:domain", &id);

    let report = engine.refresh().unwrap();
    assert!(!report.unchanged.contains(&"domain".to_string()));
    let stored = backend.stored().unwrap();
    assert!(stored.pending.is_empty());
    assert!(stored.get("domain").is_none());
    assert!(mock.live_ids().contains(&id));
    assert!(mock.deleted().is_empty());
}

#[test]
fn test_orphan_without_adapter_is_rejected() {
    let mock = MockProvider::new();
    let (engine, backend) = engine(&mock, 1);
    engine.apply(&scenario(), &[]).unwrap();

    let narrow = Engine::new(
        AdapterRegistry::new().with("libvirt:pool", mock.clone()),
        StateStore::new(backend.clone()),
    );
    let declared = scenario();
    let pools_only = reconcile::Declarations::new()
        .with_provider(declared.provider("provider").unwrap().clone())
        .with_resource(declared.resource("pool").unwrap().clone());
    let err = narrow.apply(&pools_only, &[]).unwrap_err();
    assert!(matches!(
        err,
        Error::Consistency(reconcile::ConsistencyError::OrphanState { .. })
    ));
    assert!(!backend.is_locked());
}
