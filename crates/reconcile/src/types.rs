//! Core types shared by the planner, the engine and its callers

use crate::error::Error;
use crate::value::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What the engine does to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Replace,
    Delete,
    #[serde(rename = "noop")]
    NoOp,
}

impl OperationKind {
    /// Whether the operation touches the provider
    pub fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        f.write_str(s)
    }
}

/// When the old instance of a create-before-delete replace is removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceCleanup {
    /// After every declared resource was processed, before orphans
    #[default]
    Deferred,
    /// Right after the replacement was created
    Immediate,
}

impl FromStr for ReplaceCleanup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" => Ok(Self::Deferred),
            "immediate" => Ok(Self::Immediate),
            other => Err(format!(
                "unknown replace cleanup policy '{other}' (expected deferred or immediate)"
            )),
        }
    }
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Upper bound on concurrent provider calls
    pub jobs: usize,
    pub replace_cleanup: ReplaceCleanup,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            replace_cleanup: ReplaceCleanup::default(),
        }
    }
}

/// Stage of a run, reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Pending markers left by an interrupted run are checked
    Repair,
    /// Declared resources are created, updated or replaced
    Apply,
    /// Replaced and orphaned instances are deleted
    Cleanup,
    /// Everything in state is deleted
    Destroy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Repair => "repair",
            Self::Apply => "apply",
            Self::Cleanup => "cleanup",
            Self::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// How a dispatched operation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Succeeded,
    Failed { error: String },
    /// Succeeded remotely but its state could not be written
    Uncommitted { error: String },
}

impl OperationStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One processed resource
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub name: String,
    pub kind: String,
    pub operation: OperationKind,
    /// Identifier after the operation (the deleted one for deletes)
    pub provider_id: Option<String>,
    pub status: OperationStatus,
    pub elapsed: Duration,
}

/// The operation that stopped a run
#[derive(Debug)]
pub struct Failure {
    pub name: String,
    pub operation: OperationKind,
    pub error: Error,
}

/// Outcome of an apply or destroy run
#[derive(Debug, Default)]
pub struct RunResult {
    /// Resources that reached their desired state, in completion order
    pub completed: Vec<String>,
    /// First failure, which stopped dispatch
    pub failed: Option<Failure>,
    /// Failures of operations that were already in flight
    pub concurrent_failures: Vec<Failure>,
    /// Resources never started
    pub skipped: Vec<String>,
    /// Exported outputs, only filled after a fully successful run
    pub outputs: BTreeMap<String, Json>,
    pub operations: Vec<OperationRecord>,
    /// Dispatch stopped because the run was cancelled
    pub cancelled: bool,
    /// Operations whose remote effect is not recorded in state
    pub uncommitted: Vec<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
            && self.concurrent_failures.is_empty()
            && self.uncommitted.is_empty()
            && !self.cancelled
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for record in &self.operations {
            summary.add_record(record);
        }
        summary.skipped = self.skipped.len();
        summary
    }

    /// Every failure of the run, first one first
    pub fn failures(&self) -> impl Iterator<Item = &Failure> {
        self.failed.iter().chain(self.concurrent_failures.iter())
    }
}

/// Counts of a run's operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn add_record(&mut self, record: &OperationRecord) {
        if !record.status.is_success() {
            self.failed += 1;
            return;
        }
        match record.operation {
            OperationKind::Create => self.created += 1,
            OperationKind::Update => self.updated += 1,
            OperationKind::Replace => self.replaced += 1,
            OperationKind::Delete => self.deleted += 1,
            OperationKind::NoOp => self.unchanged += 1,
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged",
            self.created, self.updated, self.replaced, self.deleted, self.unchanged
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}

/// Outcome of a refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Entries whose outputs changed
    pub updated: Vec<String>,
    /// Entries whose instance no longer exists
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl RefreshReport {
    pub fn has_drift(&self) -> bool {
        !self.updated.is_empty() || !self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(operation: OperationKind, status: OperationStatus) -> OperationRecord {
        OperationRecord {
            name: "v1".into(),
            kind: "libvirt:volume".into(),
            operation,
            provider_id: None,
            status,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn test_summary_counts_by_operation() {
        let mut summary = RunSummary::default();
        summary.add_record(&record(OperationKind::Create, OperationStatus::Succeeded));
        summary.add_record(&record(OperationKind::Replace, OperationStatus::Succeeded));
        summary.add_record(&record(OperationKind::NoOp, OperationStatus::Succeeded));
        summary.add_record(&record(
            OperationKind::Update,
            OperationStatus::Failed {
                error: "boom".into(),
            },
        ));
        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.unchanged, 1);
        assert!(!summary.is_success());
        assert_eq!(
            summary.to_string(),
            "1 created, 0 updated, 1 replaced, 0 deleted, 1 unchanged, 1 failed"
        );
    }

    #[test]
    fn test_replace_cleanup_parse() {
        assert_eq!("Immediate".parse(), Ok(ReplaceCleanup::Immediate));
        assert_eq!("deferred".parse(), Ok(ReplaceCleanup::Deferred));
        assert!("later".parse::<ReplaceCleanup>().is_err());
    }

    #[test]
    fn test_operation_kind_serde_names() {
        assert_eq!(serde_json::to_string(&OperationKind::NoOp).unwrap(), "\"noop\"");
        assert_eq!(serde_json::to_string(&OperationKind::Replace).unwrap(), "\"replace\"");
    }
}
