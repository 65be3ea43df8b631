//! Plan computation - decides what to do with each resource

use crate::diff;
use crate::error::{DeclarationError, Error, ProviderError};
use crate::graph::{self, NodeKind, ReferenceGraph};
use crate::provider::{AdapterRegistry, ProviderAdapter};
use crate::spec::{ApplyPolicy, Declarations};
use crate::state::{ResourceState, StateSnapshot};
use crate::types::OperationKind;
use crate::value::{resolve_arguments, Arguments, Json, OutputRef};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Placeholder for values that depend on a pending change
pub const UNKNOWN_VALUE: &str = "(known after apply)";

/// Operation chosen for one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub operation: OperationKind,
    /// Field paths that differ from the last applied arguments
    pub changed: BTreeSet<String>,
    /// Changed fields that forced a replacement
    pub replacing: Vec<String>,
}

impl Decision {
    fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            changed: BTreeSet::new(),
            replacing: Vec::new(),
        }
    }
}

/// Compare resolved arguments with the last applied state
///
/// Only the set of changed field paths and the replace-on-change patterns
/// decide between update and replace.
pub fn decide(
    prior: Option<&ResourceState>,
    kind: &str,
    resolved: &Arguments,
    policy: &ApplyPolicy,
    adapter: &dyn ProviderAdapter,
) -> Decision {
    let Some(prior) = prior else {
        return Decision::new(OperationKind::Create);
    };

    if prior.kind != kind {
        return Decision {
            operation: OperationKind::Replace,
            changed: BTreeSet::from(["kind".to_string()]),
            replacing: vec!["kind".to_string()],
        };
    }

    if prior.arguments == *resolved {
        return Decision::new(OperationKind::NoOp);
    }

    let changed = adapter.diff(&prior.arguments, resolved);
    if changed.is_empty() {
        return Decision::new(OperationKind::NoOp);
    }

    let replacing: Vec<String> = diff::replacing_fields(&policy.replace_on_change, &changed)
        .into_iter()
        .map(str::to_string)
        .collect();
    let operation = if replacing.is_empty() {
        OperationKind::Update
    } else {
        OperationKind::Replace
    };
    Decision {
        operation,
        changed,
        replacing,
    }
}

/// One entry of a previewed plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub name: String,
    pub kind: String,
    pub operation: OperationKind,
    pub changed: Vec<String>,
    pub replacing: Vec<String>,
    pub delete_before_replace: bool,
    /// Identifier of the existing instance, if any
    pub provider_id: Option<String>,
    /// Whether this deletes an instance left over from an earlier replacement
    pub retired: bool,
}

/// Ordered operations a run would perform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub operations: Vec<PlannedOperation>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for op in &self.operations {
            match op.operation {
                OperationKind::Create => summary.create += 1,
                OperationKind::Update => summary.update += 1,
                OperationKind::Replace => summary.replace += 1,
                OperationKind::Delete => summary.delete += 1,
                OperationKind::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.operation.is_change())
    }

    /// Operations that touch a provider
    pub fn changes(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(|op| op.operation.is_change())
    }

    pub fn get(&self, name: &str) -> Option<&PlannedOperation> {
        self.operations
            .iter()
            .find(|op| op.name == name && !op.retired)
    }
}

/// Operation counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.unchanged
        )
    }
}

/// Compute the plan an apply would execute, without touching any provider
///
/// References to resources that are about to change resolve to
/// [`UNKNOWN_VALUE`], so their consumers show up as changed.
pub fn build_plan(
    decls: &Declarations,
    graph: &ReferenceGraph,
    snapshot: &StateSnapshot,
    registry: &AdapterRegistry,
) -> Result<Plan, Error> {
    let mut plan = Plan::default();
    let mut changing: HashSet<&str> = HashSet::new();

    for &index in graph.order() {
        let node = graph.node(index);
        if node.kind == NodeKind::Provider {
            continue;
        }
        let Some(spec) = decls.resource(&node.name) else {
            continue;
        };
        let adapter = registry
            .get(&spec.kind)
            .ok_or_else(|| DeclarationError::UnknownKind {
                name: spec.name.clone(),
                kind: spec.kind.clone(),
            })?;

        let mut lookup = |r: &OutputRef| -> Result<Json, Error> {
            if changing.contains(r.resource.as_str()) {
                return Ok(Json::String(UNKNOWN_VALUE.to_string()));
            }
            snapshot
                .get(&r.resource)
                .and_then(|state| state.attribute(&r.path))
                .ok_or_else(|| {
                    Error::provider(
                        &spec.name,
                        ProviderError::MissingAttribute {
                            resource: r.resource.clone(),
                            path: r.path.to_string(),
                        },
                    )
                })
        };
        let resolved = resolve_arguments(&spec.args, &mut lookup)?;

        let prior = snapshot.get(&spec.name);
        let decision = decide(prior, &spec.kind, &resolved, &spec.policy, adapter.as_ref());
        if decision.operation.is_change() {
            changing.insert(spec.name.as_str());
        }
        plan.operations.push(PlannedOperation {
            name: spec.name.clone(),
            kind: spec.kind.clone(),
            operation: decision.operation,
            changed: decision.changed.into_iter().collect(),
            replacing: decision.replacing,
            delete_before_replace: spec.policy.delete_before_replace,
            provider_id: prior.map(|p| p.provider_id.clone()),
            retired: false,
        });
    }

    for (state, retired) in cleanup_entries(snapshot, decls) {
        plan.operations.push(PlannedOperation {
            name: state.name.clone(),
            kind: state.kind.clone(),
            operation: OperationKind::Delete,
            changed: Vec::new(),
            replacing: Vec::new(),
            delete_before_replace: false,
            provider_id: Some(state.provider_id.clone()),
            retired,
        });
    }

    log::debug!("Planned {}", plan.summary());
    Ok(plan)
}

/// Retired instances and orphaned entries in deletion order
///
/// The flag is `true` for retired instances.
pub fn cleanup_entries<'a>(
    snapshot: &'a StateSnapshot,
    decls: &Declarations,
) -> Vec<(&'a ResourceState, bool)> {
    let candidates: Vec<(&ResourceState, bool)> = snapshot
        .retired
        .iter()
        .map(|s| (s, true))
        .chain(
            snapshot
                .resources
                .values()
                .filter(|s| decls.resource(&s.name).is_none())
                .map(|s| (s, false)),
        )
        .collect();
    order_for_deletion(candidates)
}

/// Sort state entries so consumers are deleted before their producers
pub fn order_for_deletion<'a, T>(entries: Vec<(&'a ResourceState, T)>) -> Vec<(&'a ResourceState, T)> {
    let keys: Vec<(&str, &[String])> = entries
        .iter()
        .map(|(s, _)| (s.name.as_str(), s.dependencies.as_slice()))
        .collect();
    let order = graph::deletion_order(&keys);
    let mut slots: Vec<Option<(&ResourceState, T)>> = entries.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}
