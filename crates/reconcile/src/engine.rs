//! Reconciliation engine
//!
//! A run builds the reference graph, repairs work an earlier run left
//! pending, applies declared resources in dependency order and finally
//! deletes replaced and orphaned instances. Provider calls run on worker
//! threads; every state write happens on the coordinating thread.

use crate::context::{CancelToken, NoProgress, RunObserver};
use crate::error::{ConsistencyError, DeclarationError, Error, ProviderError, Result};
use crate::graph::{self, NodeKind, ReferenceGraph};
use crate::outputs::{self, OutputSpec};
use crate::planner::{self, Plan};
use crate::provider::{AdapterContext, AdapterRegistry, Created, ProviderAdapter, ProviderConfig};
use crate::scheduler::{self, Coordinator, Prepared};
use crate::spec::Declarations;
use crate::state::{PendingOperation, ResourceState, StateSnapshot, StateStore};
use crate::types::{
    EngineOptions, Failure, OperationKind, OperationRecord, OperationStatus, Phase, RefreshReport,
    ReplaceCleanup, RunResult,
};
use crate::value::{resolve_arguments, Arguments, Json, OutputRef, Outputs, Value};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// Drives runs against one state store
pub struct Engine {
    registry: AdapterRegistry,
    store: StateStore,
    options: EngineOptions,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(registry: AdapterRegistry, store: StateStore) -> Self {
        Self {
            registry,
            store,
            options: EngineOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Token that stops dispatch of further operations when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Converge state to the declarations and export `outputs`
    pub fn apply(&self, decls: &Declarations, outputs: &[OutputSpec]) -> Result<RunResult> {
        self.apply_with(decls, outputs, &mut NoProgress)
    }

    /// Like [`Engine::apply`], reporting progress to `observer`
    ///
    /// Provider failures do not return `Err`: they end up in
    /// [`RunResult::failed`] along with what was completed and skipped.
    pub fn apply_with(
        &self,
        decls: &Declarations,
        outputs: &[OutputSpec],
        observer: &mut dyn RunObserver,
    ) -> Result<RunResult> {
        let graph = ReferenceGraph::build(decls)?;
        self.check_declared_kinds(decls)?;

        let _lock = self.store.lock("apply")?;
        let snapshot = self.store.load()?;
        self.check_state_kinds(&snapshot, Some(decls))?;
        self.repair(&snapshot, observer)?;

        let mut result = RunResult::default();
        observer.on_phase_start(Phase::Apply, decls.resources.len());
        {
            let mut coordinator = ApplyCoordinator {
                engine: self,
                decls,
                graph: &graph,
                observer: &mut *observer,
                result: &mut result,
                providers: HashMap::new(),
                applied: HashSet::new(),
                running: HashMap::new(),
            };
            let outcome = scheduler::run(
                graph.dependency_lists(),
                self.options.jobs,
                &self.cancel,
                &mut coordinator,
                execute_job,
            )?;
            let result = &mut *coordinator.result;
            result.cancelled |= outcome.cancelled;
            result.skipped.extend(
                outcome
                    .skipped
                    .iter()
                    .map(|&i| graph.node(i))
                    .filter(|node| node.kind == NodeKind::Resource)
                    .map(|node| node.name.clone()),
            );
        }

        let snapshot = self.store.snapshot();
        let cleanup: Vec<(ResourceState, bool)> = planner::cleanup_entries(&snapshot, decls)
            .into_iter()
            .map(|(state, retired)| (state.clone(), retired))
            .collect();

        if !result.is_success() {
            log::warn!("Run stopped early, skipping cleanup of replaced and orphaned resources");
            result.skipped.extend(
                cleanup
                    .into_iter()
                    .filter(|(_, retired)| !retired)
                    .map(|(state, _)| state.name),
            );
            return Ok(result);
        }

        self.run_deletes(Phase::Cleanup, cleanup, observer, &mut result)?;
        if result.is_success() {
            self.store.retain_providers(|name| decls.provider(name).is_some())?;
            result.outputs = outputs::export(outputs, &self.store.snapshot())?;
        }

        let summary = result.summary();
        log::info!("Apply finished: {summary}");
        Ok(result)
    }

    /// Compute what an apply would do without touching any provider
    pub fn preview(&self, decls: &Declarations) -> Result<Plan> {
        let graph = ReferenceGraph::build(decls)?;
        self.check_declared_kinds(decls)?;
        let snapshot = self.store.load()?;
        if !snapshot.pending.is_empty() {
            log::warn!(
                "{} interrupted operations will be repaired before the next apply",
                snapshot.pending.len()
            );
        }
        planner::build_plan(decls, &graph, &snapshot, &self.registry)
    }

    /// Delete every resource recorded in state
    pub fn destroy(&self) -> Result<RunResult> {
        self.destroy_with(&mut NoProgress)
    }

    pub fn destroy_with(&self, observer: &mut dyn RunObserver) -> Result<RunResult> {
        let _lock = self.store.lock("destroy")?;
        let snapshot = self.store.load()?;
        self.check_state_kinds(&snapshot, None)?;
        self.repair(&snapshot, observer)?;

        let snapshot = self.store.snapshot();
        let entries: Vec<(&ResourceState, bool)> = snapshot
            .retired
            .iter()
            .map(|s| (s, true))
            .chain(snapshot.resources.values().map(|s| (s, false)))
            .collect();
        let entries: Vec<(ResourceState, bool)> = planner::order_for_deletion(entries)
            .into_iter()
            .map(|(state, retired)| (state.clone(), retired))
            .collect();

        let mut result = RunResult::default();
        self.run_deletes(Phase::Destroy, entries, observer, &mut result)?;
        if result.is_success() {
            self.store.retain_providers(|_| false)?;
        }
        log::info!("Destroy finished: {}", result.summary());
        Ok(result)
    }

    /// Re-read every recorded resource and record drift
    pub fn refresh(&self) -> Result<RefreshReport> {
        let _lock = self.store.lock("refresh")?;
        let snapshot = self.store.load()?;
        self.check_state_kinds(&snapshot, None)?;
        self.repair(&snapshot, &mut NoProgress)?;

        let mut report = RefreshReport::default();
        for (name, state) in &self.store.snapshot().resources {
            let adapter = self.adapter_for(name, &state.kind)?;
            let provider = state.provider.as_deref().and_then(|p| self.store.provider(p));
            let ctx = AdapterContext {
                name,
                kind: &state.kind,
                provider: provider.as_ref(),
            };
            match adapter
                .read(&ctx, &state.provider_id)
                .map_err(|e| Error::provider(name, e))?
            {
                None => {
                    log::warn!("{name} ({}) no longer exists, removing it from state", state.provider_id);
                    self.store.remove(name)?;
                    report.removed.push(name.clone());
                }
                Some(outputs) if outputs == state.outputs => report.unchanged.push(name.clone()),
                Some(outputs) => {
                    log::info!("Outputs of {name} changed outside of virtstack");
                    self.store.put(ResourceState {
                        outputs,
                        updated_at: Utc::now(),
                        ..state.clone()
                    })?;
                    report.updated.push(name.clone());
                }
            }
        }
        Ok(report)
    }

    /// Evaluate outputs against the persisted state
    pub fn outputs(&self, specs: &[OutputSpec]) -> Result<BTreeMap<String, Json>> {
        let snapshot = self.store.load()?;
        outputs::export(specs, &snapshot)
    }

    fn adapter_for(&self, name: &str, kind: &str) -> Result<Arc<dyn ProviderAdapter>> {
        self.registry.get(kind).ok_or_else(|| {
            ConsistencyError::OrphanState {
                name: name.to_string(),
                kind: kind.to_string(),
            }
            .into()
        })
    }

    fn check_declared_kinds(&self, decls: &Declarations) -> Result<()> {
        for resource in &decls.resources {
            if !self.registry.contains(&resource.kind) {
                return Err(DeclarationError::UnknownKind {
                    name: resource.name.clone(),
                    kind: resource.kind.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Every state entry the run may have to read or delete needs an adapter
    fn check_state_kinds(&self, snapshot: &StateSnapshot, decls: Option<&Declarations>) -> Result<()> {
        let needs_adapter = |state: &ResourceState| match decls.and_then(|d| d.resource(&state.name)) {
            Some(spec) => spec.kind != state.kind,
            None => true,
        };
        let entries = snapshot
            .resources
            .values()
            .filter(|&s| needs_adapter(s))
            .chain(snapshot.retired.iter())
            .map(|s| (s.name.as_str(), s.kind.as_str()))
            .chain(
                snapshot
                    .pending
                    .iter()
                    .map(|(name, p)| (name.as_str(), p.kind.as_str())),
            );
        for (name, kind) in entries {
            self.adapter_for(name, kind)?;
        }
        Ok(())
    }

    /// Reconcile entries whose last operation never finished recording
    fn repair(&self, snapshot: &StateSnapshot, observer: &mut dyn RunObserver) -> Result<()> {
        if snapshot.pending.is_empty() {
            return Ok(());
        }
        observer.on_phase_start(Phase::Repair, snapshot.pending.len());

        for (name, pending) in &snapshot.pending {
            let current = snapshot.get(name);
            let Some(id) = pending
                .provider_id
                .clone()
                .or_else(|| current.map(|s| s.provider_id.clone()))
            else {
                log::warn!(
                    "Interrupted {} of {name} never reported an identifier; an untracked instance may exist",
                    pending.operation
                );
                self.store.clear_pending(name)?;
                continue;
            };

            let tracked = current.filter(|s| s.provider_id == id);
            let retired = snapshot
                .retired
                .iter()
                .find(|s| s.name == *name && s.provider_id == id);
            let (kind, binding) = tracked
                .or(retired)
                .map_or((pending.kind.as_str(), None), |s| (s.kind.as_str(), s.provider.as_deref()));
            let adapter = self.adapter_for(name, kind)?;
            let provider = binding.and_then(|p| self.store.provider(p));
            let ctx = AdapterContext {
                name,
                kind,
                provider: provider.as_ref(),
            };

            log::info!("Repairing interrupted {} of {name}", pending.operation);
            let found = adapter.read(&ctx, &id).map_err(|e| Error::provider(name, e))?;
            if matches!(pending.operation, OperationKind::Create | OperationKind::Replace) {
                log::warn!("Interrupted {} of {name} may have left an untracked instance", pending.operation);
            }
            match (found, tracked) {
                (Some(outputs), Some(state)) => self.store.put(ResourceState {
                    outputs,
                    updated_at: Utc::now(),
                    ..state.clone()
                })?,
                (None, Some(_)) => {
                    log::warn!("{name} ({id}) no longer exists, removing it from state");
                    self.store.remove(name)?;
                }
                (None, None) => {
                    self.store.remove_retired(name, &id)?;
                    self.store.clear_pending(name)?;
                }
                (Some(_), None) => self.store.clear_pending(name)?,
            }
        }
        Ok(())
    }

    /// Delete state entries (already in deletion order) with the run's concurrency
    fn run_deletes(
        &self,
        phase: Phase,
        entries: Vec<(ResourceState, bool)>,
        observer: &mut dyn RunObserver,
        result: &mut RunResult,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        observer.on_phase_start(phase, entries.len());

        let keys: Vec<(&str, &[String])> = entries
            .iter()
            .map(|(s, _)| (s.name.as_str(), s.dependencies.as_slice()))
            .collect();
        let mut prerequisites = graph::deletion_prerequisites(&keys);
        if graph::topological_order(&prerequisites).is_err() {
            // Keep the given order, one at a time.
            prerequisites = (0..entries.len())
                .map(|i| if i == 0 { Vec::new() } else { vec![i - 1] })
                .collect();
        }

        let mut coordinator = DeleteCoordinator {
            engine: self,
            entries: &entries,
            observer,
            result: &mut *result,
            running: HashMap::new(),
        };
        let outcome = scheduler::run(
            &prerequisites,
            self.options.jobs,
            &self.cancel,
            &mut coordinator,
            execute_job,
        )?;

        result.cancelled |= outcome.cancelled;
        result.skipped.extend(
            outcome
                .skipped
                .iter()
                .map(|&i| &entries[i])
                .filter(|(_, retired)| !retired)
                .map(|(state, _)| state.name.clone()),
        );
        Ok(())
    }
}

// ============================================================================
// Jobs (run on workers)
// ============================================================================

struct ApplyJob {
    name: String,
    kind: String,
    adapter: Arc<dyn ProviderAdapter>,
    provider: Option<ProviderConfig>,
    step: Step,
}

enum Step {
    Create {
        args: Arguments,
    },
    Update {
        id: String,
        old: Arguments,
        new: Arguments,
    },
    Replace {
        args: Arguments,
        old: OldInstance,
        order: ReplaceOrder,
    },
    Delete {
        id: String,
    },
}

/// The instance a replace supersedes
struct OldInstance {
    id: String,
    kind: String,
    adapter: Arc<dyn ProviderAdapter>,
    provider: Option<ProviderConfig>,
}

#[derive(Clone, Copy)]
enum ReplaceOrder {
    DeleteFirst,
    CreateFirst { delete_old: bool },
}

enum Applied {
    Created(Created),
    Updated(Outputs),
    Replaced { created: Created, old_deleted: bool },
    Deleted,
}

/// A failed job and how far it got
struct JobError {
    error: ProviderError,
    /// The old instance of a replace is already gone
    old_deleted: bool,
    /// The replacement was created before the failure
    created: Option<Created>,
}

impl From<ProviderError> for JobError {
    fn from(error: ProviderError) -> Self {
        Self {
            error,
            old_deleted: false,
            created: None,
        }
    }
}

type JobResult = std::result::Result<Applied, JobError>;

fn execute_job(job: ApplyJob) -> JobResult {
    let ctx = AdapterContext {
        name: &job.name,
        kind: &job.kind,
        provider: job.provider.as_ref(),
    };
    match job.step {
        Step::Create { args } => {
            log::debug!("Creating {} ({})", job.name, job.kind);
            Ok(Applied::Created(job.adapter.create(&ctx, &args)?))
        }
        Step::Update { id, old, new } => {
            log::debug!("Updating {} ({id})", job.name);
            Ok(Applied::Updated(job.adapter.update(&ctx, &id, &old, &new)?))
        }
        Step::Replace { args, old, order } => {
            let old_ctx = AdapterContext {
                name: &job.name,
                kind: &old.kind,
                provider: old.provider.as_ref(),
            };
            match order {
                ReplaceOrder::DeleteFirst => {
                    log::debug!("Replacing {}: deleting {} first", job.name, old.id);
                    old.adapter.delete(&old_ctx, &old.id)?;
                    let created = job.adapter.create(&ctx, &args).map_err(|error| JobError {
                        error,
                        old_deleted: true,
                        created: None,
                    })?;
                    Ok(Applied::Replaced {
                        created,
                        old_deleted: true,
                    })
                }
                ReplaceOrder::CreateFirst { delete_old } => {
                    log::debug!("Replacing {}: creating replacement for {}", job.name, old.id);
                    let created = job.adapter.create(&ctx, &args)?;
                    if !delete_old {
                        return Ok(Applied::Replaced {
                            created,
                            old_deleted: false,
                        });
                    }
                    match old.adapter.delete(&old_ctx, &old.id) {
                        Ok(()) => Ok(Applied::Replaced {
                            created,
                            old_deleted: true,
                        }),
                        Err(error) => Err(JobError {
                            error,
                            old_deleted: false,
                            created: Some(created),
                        }),
                    }
                }
            }
        }
        Step::Delete { id } => {
            log::debug!("Deleting {} ({id})", job.name);
            job.adapter.delete(&ctx, &id)?;
            Ok(Applied::Deleted)
        }
    }
}

fn panicked(message: &str) -> JobError {
    JobError::from(ProviderError::Other(anyhow::anyhow!(
        "provider adapter panicked: {message}"
    )))
}

fn record_failure(result: &mut RunResult, failure: Failure) {
    log::error!("{} of {} failed: {}", failure.operation, failure.name, failure.error);
    if result.failed.is_none() {
        result.failed = Some(failure);
    } else {
        result.concurrent_failures.push(failure);
    }
}

// ============================================================================
// Apply phase
// ============================================================================

struct Running {
    operation: OperationKind,
    prior: Option<ResourceState>,
    arguments: Arguments,
    dependencies: Vec<String>,
    started: Instant,
}

struct ApplyCoordinator<'a> {
    engine: &'a Engine,
    decls: &'a Declarations,
    graph: &'a ReferenceGraph,
    observer: &'a mut dyn RunObserver,
    result: &'a mut RunResult,
    /// Providers resolved in this run
    providers: HashMap<String, ProviderConfig>,
    /// Resources that reached their desired state in this run
    applied: HashSet<String>,
    running: HashMap<usize, Running>,
}

impl ApplyCoordinator<'_> {
    fn store(&self) -> &StateStore {
        &self.engine.store
    }

    fn resolve(&self, consumer: &str, args: &BTreeMap<String, Value>) -> Result<Arguments> {
        let store = self.store();
        resolve_arguments(args, &mut |r: &OutputRef| -> Result<Json> {
            let unresolved = || ConsistencyError::UnresolvedReference {
                consumer: consumer.to_string(),
                producer: r.resource.clone(),
            };
            if !self.applied.contains(&r.resource) {
                return Err(unresolved().into());
            }
            let producer = store.get(&r.resource).ok_or_else(unresolved)?;
            producer.attribute(&r.path).ok_or_else(|| {
                Error::provider(
                    consumer,
                    ProviderError::MissingAttribute {
                        resource: r.resource.clone(),
                        path: r.path.to_string(),
                    },
                )
            })
        })
    }

    fn provider_config(&self, binding: Option<&str>) -> Option<ProviderConfig> {
        let name = binding?;
        self.providers
            .get(name)
            .cloned()
            .or_else(|| self.store().provider(name))
    }

    fn complete(&mut self, record: OperationRecord) {
        if record.status.is_success() {
            self.applied.insert(record.name.clone());
            self.result.completed.push(record.name.clone());
        }
        self.observer.on_operation_complete(&record);
        self.result.operations.push(record);
    }

    fn fail(&mut self, name: &str, operation: OperationKind, error: Error) {
        record_failure(
            self.result,
            Failure {
                name: name.to_string(),
                operation,
                error,
            },
        );
    }

    fn prepare_provider(&mut self, name: &str) -> bool {
        let decls = self.decls;
        let Some(spec) = decls.provider(name) else {
            return false;
        };
        let config = match self.resolve(name, &spec.args) {
            Ok(arguments) => ProviderConfig::new(name, &spec.plugin, arguments),
            Err(error) => {
                self.fail(name, OperationKind::NoOp, error);
                return false;
            }
        };
        if let Err(error) = self.store().put_provider(&config) {
            self.fail(name, OperationKind::NoOp, error.into());
            return false;
        }
        log::debug!("Resolved provider {name} ({})", config.plugin);
        self.providers.insert(name.to_string(), config);
        true
    }

    fn prepare_resource(&mut self, index: usize, name: &str) -> Prepared<ApplyJob> {
        let decls = self.decls;
        let Some(spec) = decls.resource(name) else {
            return Prepared::Done(false);
        };
        let started = Instant::now();
        let prior = self.store().get(name);
        let attempted = if prior.is_some() {
            OperationKind::Update
        } else {
            OperationKind::Create
        };

        let Some(adapter) = self.engine.registry.get(&spec.kind) else {
            let error = DeclarationError::UnknownKind {
                name: name.to_string(),
                kind: spec.kind.clone(),
            };
            self.fail(name, attempted, error.into());
            return Prepared::Done(false);
        };
        let arguments = match self.resolve(name, &spec.args) {
            Ok(arguments) => arguments,
            Err(error) => {
                self.fail(name, attempted, error);
                return Prepared::Done(false);
            }
        };

        let decision = planner::decide(
            prior.as_ref(),
            &spec.kind,
            &arguments,
            &spec.policy,
            adapter.as_ref(),
        );
        let dependencies = self.graph.resource_dependencies_of(name);
        let binding = spec.provider.name().map(str::to_string);
        let provider = self.provider_config(binding.as_deref());

        let step = match (decision.operation, prior.as_ref()) {
            (OperationKind::NoOp, Some(prior)) => {
                return Prepared::Done(self.carry_forward(prior, dependencies, binding, started));
            }
            (OperationKind::Update, Some(prior)) => Step::Update {
                id: prior.provider_id.clone(),
                old: prior.arguments.clone(),
                new: arguments.clone(),
            },
            (OperationKind::Replace, Some(prior)) => {
                let old_adapter = match self.engine.adapter_for(name, &prior.kind) {
                    Ok(adapter) => adapter,
                    Err(error) => {
                        self.fail(name, OperationKind::Replace, error);
                        return Prepared::Done(false);
                    }
                };
                let order = if spec.policy.delete_before_replace {
                    ReplaceOrder::DeleteFirst
                } else {
                    ReplaceOrder::CreateFirst {
                        delete_old: self.engine.options.replace_cleanup == ReplaceCleanup::Immediate,
                    }
                };
                log::debug!("{name} must be replaced ({})", decision.replacing.join(", "));
                Step::Replace {
                    args: arguments.clone(),
                    old: OldInstance {
                        id: prior.provider_id.clone(),
                        kind: prior.kind.clone(),
                        adapter: old_adapter,
                        provider: self.provider_config(prior.provider.as_deref()),
                    },
                    order,
                }
            }
            _ => Step::Create {
                args: arguments.clone(),
            },
        };
        let operation = match step {
            Step::Create { .. } => OperationKind::Create,
            Step::Update { .. } => OperationKind::Update,
            Step::Replace { .. } => OperationKind::Replace,
            Step::Delete { .. } => OperationKind::Delete,
        };

        let pending = PendingOperation::new(
            operation,
            &spec.kind,
            prior.as_ref().map(|p| p.provider_id.clone()),
        );
        if let Err(error) = self.store().mark_pending(name, pending) {
            self.fail(name, operation, error.into());
            return Prepared::Done(false);
        }

        log::info!("{} {name}", capitalize(operation));
        self.observer.on_operation_start(name, operation);
        self.running.insert(
            index,
            Running {
                operation,
                prior,
                arguments,
                dependencies,
                started,
            },
        );
        Prepared::Dispatch(ApplyJob {
            name: name.to_string(),
            kind: spec.kind.clone(),
            adapter,
            provider,
            step,
        })
    }

    /// Keep an unchanged resource, refreshing its recorded dependencies
    fn carry_forward(
        &mut self,
        prior: &ResourceState,
        dependencies: Vec<String>,
        binding: Option<String>,
        started: Instant,
    ) -> bool {
        let mut status = OperationStatus::Succeeded;
        if prior.dependencies != dependencies || prior.provider != binding {
            let state = prior.clone().with_dependencies(dependencies).with_provider(binding);
            if let Err(error) = self.store().put(state) {
                status = OperationStatus::Uncommitted {
                    error: error.to_string(),
                };
                self.result.uncommitted.push(prior.name.clone());
                self.fail(&prior.name, OperationKind::NoOp, error.into());
            }
        }
        let success = status.is_success();
        self.complete(OperationRecord {
            name: prior.name.clone(),
            kind: prior.kind.clone(),
            operation: OperationKind::NoOp,
            provider_id: Some(prior.provider_id.clone()),
            status,
            elapsed: started.elapsed(),
        });
        success
    }
}

impl Coordinator for ApplyCoordinator<'_> {
    type Job = ApplyJob;
    type Output = JobResult;

    fn prepare(&mut self, index: usize) -> Prepared<ApplyJob> {
        let graph = self.graph;
        let node = graph.node(index);
        match node.kind {
            NodeKind::Provider => Prepared::Done(self.prepare_provider(&node.name)),
            NodeKind::Resource => self.prepare_resource(index, &node.name),
        }
    }

    fn finish(&mut self, index: usize, output: std::result::Result<JobResult, String>) -> bool {
        let Some(running) = self.running.remove(&index) else {
            return false;
        };
        let (graph, decls) = (self.graph, self.decls);
        let name = graph.node(index).name.as_str();
        let Some(spec) = decls.resource(name) else {
            return false;
        };
        let binding = spec.provider.name().map(str::to_string);
        let new_state = |created: Created| {
            ResourceState::new(name, &spec.kind, created.id, running.arguments.clone(), created.outputs)
                .with_dependencies(running.dependencies.clone())
                .with_provider(binding.clone())
        };

        let output = output.unwrap_or_else(|message| Err(panicked(&message)));
        let (provider_id, write, failure) = match output {
            Ok(Applied::Created(created)) => {
                let state = new_state(created);
                (Some(state.provider_id.clone()), self.store().put(state), None)
            }
            Ok(Applied::Updated(outputs)) => match running.prior.as_ref() {
                Some(prior) => {
                    let state = prior
                        .updated(running.arguments.clone(), outputs, running.dependencies.clone())
                        .with_provider(binding.clone());
                    (Some(state.provider_id.clone()), self.store().put(state), None)
                }
                None => (None, Ok(()), None),
            },
            Ok(Applied::Replaced { created, old_deleted }) => {
                let state = new_state(created);
                let id = Some(state.provider_id.clone());
                let write = match running.prior.clone() {
                    Some(prior) if !old_deleted => self.store().put_replacing(state, prior),
                    _ => self.store().put(state),
                };
                (id, write, None)
            }
            Ok(Applied::Deleted) => (None, self.store().remove(name).map(|_| ()), None),
            Err(job) => {
                let prior_id = running.prior.as_ref().map(|p| p.provider_id.clone());
                let (id, write) = match (job.created, running.prior.clone()) {
                    (Some(created), Some(prior)) => {
                        let state = new_state(created);
                        (Some(state.provider_id.clone()), self.store().put_replacing(state, prior))
                    }
                    _ if job.old_deleted => (None, self.store().remove(name).map(|_| ())),
                    _ => (prior_id, self.store().clear_pending(name)),
                };
                (id, write, Some(Error::provider(name, job.error)))
            }
        };

        let status = match (&write, &failure) {
            (Err(error), _) => OperationStatus::Uncommitted {
                error: error.to_string(),
            },
            (Ok(()), Some(error)) => OperationStatus::Failed {
                error: error.to_string(),
            },
            (Ok(()), None) => OperationStatus::Succeeded,
        };
        let success = status.is_success();
        self.complete(OperationRecord {
            name: name.to_string(),
            kind: spec.kind.clone(),
            operation: running.operation,
            provider_id,
            status,
            elapsed: running.started.elapsed(),
        });

        if let Some(error) = failure {
            self.fail(name, running.operation, error);
        }
        if let Err(error) = write {
            log::error!("Could not record {} of {name}; state must be repaired", running.operation);
            self.result.uncommitted.push(name.to_string());
            self.fail(name, running.operation, error.into());
        }
        success
    }
}

// ============================================================================
// Delete phases (cleanup and destroy)
// ============================================================================

struct DeleteCoordinator<'a> {
    engine: &'a Engine,
    /// State entries with a flag for retired instances
    entries: &'a [(ResourceState, bool)],
    observer: &'a mut dyn RunObserver,
    result: &'a mut RunResult,
    running: HashMap<usize, Instant>,
}

impl DeleteCoordinator<'_> {
    fn fail(&mut self, name: &str, error: Error) {
        record_failure(
            self.result,
            Failure {
                name: name.to_string(),
                operation: OperationKind::Delete,
                error,
            },
        );
    }
}

impl Coordinator for DeleteCoordinator<'_> {
    type Job = ApplyJob;
    type Output = JobResult;

    fn prepare(&mut self, index: usize) -> Prepared<ApplyJob> {
        let entries = self.entries;
        let (state, _) = &entries[index];
        let adapter = match self.engine.adapter_for(&state.name, &state.kind) {
            Ok(adapter) => adapter,
            Err(error) => {
                self.fail(&state.name, error);
                return Prepared::Done(false);
            }
        };
        let provider = state
            .provider
            .as_deref()
            .and_then(|p| self.engine.store.provider(p));
        if provider.is_none() && state.provider.is_some() {
            log::warn!("Provider of {} is not recorded, using the default connection", state.name);
        }

        let pending = PendingOperation::new(
            OperationKind::Delete,
            &state.kind,
            Some(state.provider_id.clone()),
        );
        if let Err(error) = self.engine.store.mark_pending(&state.name, pending) {
            self.fail(&state.name, error.into());
            return Prepared::Done(false);
        }

        log::info!("Delete {} ({})", state.name, state.provider_id);
        self.observer.on_operation_start(&state.name, OperationKind::Delete);
        self.running.insert(index, Instant::now());
        Prepared::Dispatch(ApplyJob {
            name: state.name.clone(),
            kind: state.kind.clone(),
            adapter,
            provider,
            step: Step::Delete {
                id: state.provider_id.clone(),
            },
        })
    }

    fn finish(&mut self, index: usize, output: std::result::Result<JobResult, String>) -> bool {
        let started = self.running.remove(&index).unwrap_or_else(Instant::now);
        let entries = self.entries;
        let (state, retired) = &entries[index];
        let store = &self.engine.store;

        let output = output.unwrap_or_else(|message| Err(panicked(&message)));
        let (write, failure) = match output {
            Ok(_) if *retired => (store.remove_retired(&state.name, &state.provider_id), None),
            Ok(_) => (store.remove(&state.name).map(|_| ()), None),
            Err(job) => (
                store.clear_pending(&state.name),
                Some(Error::provider(&state.name, job.error)),
            ),
        };

        let status = match (&write, &failure) {
            (Err(error), _) => OperationStatus::Uncommitted {
                error: error.to_string(),
            },
            (Ok(()), Some(error)) => OperationStatus::Failed {
                error: error.to_string(),
            },
            (Ok(()), None) => OperationStatus::Succeeded,
        };
        let success = status.is_success();
        if success && !retired {
            self.result.completed.push(state.name.clone());
        }
        let record = OperationRecord {
            name: state.name.clone(),
            kind: state.kind.clone(),
            operation: OperationKind::Delete,
            provider_id: Some(state.provider_id.clone()),
            status,
            elapsed: started.elapsed(),
        };
        self.observer.on_operation_complete(&record);
        self.result.operations.push(record);

        if let Some(error) = failure {
            self.fail(&state.name, error);
        }
        if let Err(error) = write {
            self.result.uncommitted.push(state.name.clone());
            self.fail(&state.name, error.into());
        }
        success
    }
}

fn capitalize(operation: OperationKind) -> String {
    let text = operation.to_string();
    let mut chars = text.chars();
    chars
        .next()
        .map(|c| c.to_uppercase().chain(chars).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize_operation() {
        assert_eq!(capitalize(OperationKind::Replace), "Replace");
        assert_eq!(capitalize(OperationKind::NoOp), "No-op");
    }
}
