//! # Reconcile
//!
//! Dependency-ordered reconciliation of declared infrastructure.
//!
//! Callers declare the resources they want, each with arguments that may
//! reference another resource's outputs. The engine orders the declarations
//! by those references, compares each one with what the last run recorded,
//! and issues the minimal create, update, replace and delete calls through
//! provider adapters, persisting state after every operation.
//!
//! ## Core Concepts
//!
//! - **ResourceSpec**: one desired resource (logical name, kind, arguments, policies)
//! - **Value**: a literal or a reference to another resource's output
//! - **ReferenceGraph**: producer → consumer edges and a stable topological order
//! - **ProviderAdapter**: create/read/update/delete/diff for a resource kind
//! - **StateStore**: last applied arguments, identifiers and outputs per resource
//! - **Engine**: runs apply, preview, destroy and refresh
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     AdapterRegistry, Declarations, Engine, OutputSpec, ResourceSpec, StateStore, Value,
//! };
//!
//! let decls = Declarations::new()
//!     .with_resource(
//!         ResourceSpec::new("cluster", "libvirt:pool")
//!             .arg("type", Value::literal("dir"))
//!             .arg("path", Value::literal("/pool/cluster_storage")),
//!     )
//!     .with_resource(
//!         ResourceSpec::new("ubuntu-image", "libvirt:volume")
//!             .arg_ref("pool", "cluster", "name")?
//!             .arg("source", Value::literal("https://cloud-images.ubuntu.com/...")),
//!     );
//!
//! let registry = AdapterRegistry::new()
//!     .with("libvirt:pool", PoolAdapter::new())
//!     .with("libvirt:volume", VolumeAdapter::new());
//!
//! let engine = Engine::new(registry, StateStore::open_dir(".virtstack"));
//! let result = engine.apply(&decls, &[OutputSpec::new("pool", "cluster.name".parse()?)])?;
//! assert!(result.is_success());
//! ```
//!
//! ## Extension Traits
//!
//! - [`ProviderAdapter`]: remote side effects for one or more kinds
//! - [`StateBackend`]: where state documents are stored and locked
//! - [`RunObserver`]: progress reporting
//!
//! The crate has no terminal UI or process plumbing of its own.

pub mod context;
pub mod diff;
pub mod engine;
pub mod error;
pub mod graph;
pub mod outputs;
pub mod planner;
pub mod provider;
mod scheduler;
pub mod spec;
pub mod state;
pub mod types;
pub mod value;

// Re-export main types at crate root
pub use context::{CancelToken, NoProgress, RunObserver};
pub use engine::Engine;
pub use error::{
    ConsistencyError, DeclarationError, Error, ProviderError, Result, StateStoreError,
};
pub use graph::ReferenceGraph;
pub use outputs::{export, OutputSpec};
pub use planner::{Plan, PlanSummary, PlannedOperation, UNKNOWN_VALUE};
pub use provider::{AdapterContext, AdapterRegistry, Created, ProviderAdapter, ProviderConfig};
pub use spec::{ApplyPolicy, Declarations, ProviderBinding, ProviderSpec, ResourceSpec};
pub use state::{
    FileBackend, MemoryBackend, PendingOperation, ResourceState, StateBackend, StateLock,
    StateSnapshot, StateStore,
};
pub use types::{
    EngineOptions, Failure, OperationKind, OperationRecord, OperationStatus, Phase, RefreshReport,
    ReplaceCleanup, RunResult, RunSummary,
};
pub use value::{Arguments, AttrPath, Json, OutputRef, Outputs, Value};
