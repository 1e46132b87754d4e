//! Cooperative cancellation flag shared by every task of a job

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "is this job still running" flag.
///
/// Checked by every task before and during its unit of work and by the
/// orchestrator before every polling iteration. Tasks that have already been
/// dequeued finish their current unit but must not start new recursive work
/// once the flag is cleared. Pausing a job does NOT clear it.
#[derive(Debug, Clone, Default)]
pub struct SyncControl {
    terminated: Arc<AtomicBool>,
}

impl SyncControl {
    /// Create a control handle in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the job is still running
    pub fn is_running(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    /// Request a hard stop; idempotent
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}
