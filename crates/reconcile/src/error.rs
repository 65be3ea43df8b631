//! Error taxonomy for the reconciliation core
//!
//! Errors are grouped by who is at fault, which decides how a run reacts:
//! declaration errors abort before any side effect, provider errors abort at
//! the failing resource, consistency errors flag an engine bug, and state
//! store errors abort or leave an uncommitted operation behind.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Problems with the declared resource set, detected before any provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    /// The reference graph contains a cycle
    #[error("dependency cycle: {}", .names.join(" -> "))]
    Cycle {
        /// Participants in cycle order, first name repeated at the end
        names: Vec<String>,
    },

    /// A reference or provider binding names something that is not declared
    #[error("`{consumer}` references `{target}`, which is not declared")]
    DanglingReference { consumer: String, target: String },

    /// Two declarations share a logical name
    #[error("logical name `{0}` is declared more than once")]
    DuplicateName(String),

    /// No adapter is registered for a declared kind
    #[error("no provider adapter registered for kind `{kind}` (resource `{name}`)")]
    UnknownKind { name: String, kind: String },
}

/// Engine invariant violations. These are bugs, never user errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// A consumer was scheduled before its producer had state
    #[error("`{consumer}` was scheduled before its producer `{producer}` was applied")]
    UnresolvedReference { consumer: String, producer: String },

    /// A state entry with no declaration cannot be deleted because its kind is unknown
    #[error("orphaned state entry `{name}` has kind `{kind}` with no registered adapter")]
    OrphanState { name: String, kind: String },
}

/// Failures reading, writing or locking persisted state.
#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("failed to read state from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state to {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("state version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("state is locked by {holder} since {since}")]
    Locked {
        holder: String,
        since: DateTime<Utc>,
    },

    #[error("state backend unavailable: {0}")]
    Unavailable(String),
}

/// Terminal failure reported by a provider adapter.
///
/// Adapters retry transient failures themselves; anything surfaced here is final
/// for the current run.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("remote call failed: {0}")]
    Remote(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// A reference points at an attribute its producer never exposed
    #[error("`{resource}` exposes no attribute `{path}`")]
    MissingAttribute { resource: String, path: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Top-level error type of the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid declarations: {0}")]
    Declaration(#[from] DeclarationError),

    #[error("provider operation on `{name}` failed: {source}")]
    Provider {
        name: String,
        #[source]
        source: ProviderError,
    },

    #[error("engine invariant violated: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("state store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("cannot resolve output `{output}` from `{resource}`: {reason}")]
    OutputResolution {
        output: String,
        resource: String,
        reason: String,
    },

    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub fn provider(name: impl Into<String>, source: ProviderError) -> Self {
        Self::Provider {
            name: name.into(),
            source,
        }
    }

    /// Logical names involved in this error, for diagnostics
    pub fn logical_names(&self) -> Vec<&str> {
        match self {
            Self::Declaration(DeclarationError::Cycle { names }) => {
                let mut names: Vec<&str> = names.iter().map(String::as_str).collect();
                names.sort_unstable();
                names.dedup();
                names
            }
            Self::Declaration(DeclarationError::DanglingReference { consumer, target }) => {
                vec![consumer.as_str(), target.as_str()]
            }
            Self::Declaration(DeclarationError::DuplicateName(name)) => vec![name.as_str()],
            Self::Declaration(DeclarationError::UnknownKind { name, .. }) => vec![name.as_str()],
            Self::Provider { name, .. } => vec![name.as_str()],
            Self::Consistency(ConsistencyError::UnresolvedReference { consumer, producer }) => {
                vec![consumer.as_str(), producer.as_str()]
            }
            Self::Consistency(ConsistencyError::OrphanState { name, .. }) => vec![name.as_str()],
            Self::StateStore(_) | Self::WorkerPool(_) => Vec::new(),
            Self::OutputResolution { resource, .. } => vec![resource.as_str()],
        }
    }

    /// Whether the error was raised before anything touched a provider
    pub fn is_declaration(&self) -> bool {
        matches!(self, Self::Declaration(_))
    }
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;
