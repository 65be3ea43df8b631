//! Run observers and cancellation
//!
//! These let the engine report progress and be stopped without depending on
//! any particular terminal UI.

use crate::types::{OperationKind, OperationRecord, Phase};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared with the engine
///
/// Checked before each dispatch; operations already in flight run to
/// completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be used for another run
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Progress callback for runs
///
/// Every method is called from the coordinating thread, never from workers.
pub trait RunObserver: Send {
    /// Called when a phase begins with the number of entries it covers
    fn on_phase_start(&mut self, phase: Phase, count: usize);

    /// Called when an operation is dispatched to a provider
    fn on_operation_start(&mut self, name: &str, operation: OperationKind);

    /// Called when a resource was processed, including no-ops
    fn on_operation_complete(&mut self, record: &OperationRecord);
}

/// No-op observer
pub struct NoProgress;

impl RunObserver for NoProgress {
    fn on_phase_start(&mut self, _phase: Phase, _count: usize) {}
    fn on_operation_start(&mut self, _name: &str, _operation: OperationKind) {}
    fn on_operation_complete(&mut self, _record: &OperationRecord) {}
}
