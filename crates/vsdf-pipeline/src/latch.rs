//! Fault latch and lifecycle status shared by the producer and the encode worker.
//!
//! The status is a single value behind one mutex, so a reader never sees a
//! half-applied transition.  Transitions are monotonic:
//!
//! ```text
//! Running ──► Draining ──► Stopped
//!    │           │
//!    └───────────┴──► Failed(cause)      (terminal)
//! ```
//!
//! The first failure wins.  Later trips keep the original cause so that both
//! threads report the same error.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};
use vsdf_core::error::{EngineError, Result};

/// Lifecycle of one run.
#[derive(Clone, Debug)]
pub enum PipelineStatus {
    /// Frames are being produced and encoded.
    Running,
    /// The producer finished; already-queued frames are still being encoded.
    Draining,
    /// A stage failed. Nothing else is dequeued or encoded.
    Failed(EngineError),
    /// The worker exited after a clean drain.
    Stopped,
}

impl PipelineStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// One-way fault flag plus lifecycle status.
#[derive(Debug)]
pub struct FaultLatch {
    status: Mutex<PipelineStatus>,
}

impl FaultLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(PipelineStatus::Running),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipelineStatus> {
        // A panic while holding this lock cannot leave a torn status: every
        // critical section is a single assignment.
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> PipelineStatus {
        self.lock().clone()
    }

    /// Latch `cause` unless a failure is already latched, and return the cause
    /// that ended up latched.
    ///
    /// A run that already stopped cleanly is not failed retroactively.
    pub fn trip(&self, cause: EngineError) -> EngineError {
        let mut status = self.lock();
        match &*status {
            PipelineStatus::Failed(root) => {
                debug!(ignored = %cause, root = %root, "Fault latch already tripped");
                root.clone()
            }
            PipelineStatus::Stopped => {
                debug!(ignored = %cause, "Fault after clean stop ignored");
                cause
            }
            PipelineStatus::Running | PipelineStatus::Draining => {
                error!(error = %cause, code = cause.error_code(), "Pipeline failed");
                *status = PipelineStatus::Failed(cause.clone());
                cause
            }
        }
    }

    /// `Running → Draining`. Returns `false` when the run is not running.
    pub fn begin_drain(&self) -> bool {
        let mut status = self.lock();
        if matches!(*status, PipelineStatus::Running) {
            *status = PipelineStatus::Draining;
            true
        } else {
            false
        }
    }

    /// `Running | Draining → Stopped`. A latched failure is kept.
    pub fn mark_stopped(&self) {
        let mut status = self.lock();
        if !status.is_failed() {
            *status = PipelineStatus::Stopped;
        }
    }

    /// The latched cause, if any.
    pub fn failure(&self) -> Option<EngineError> {
        match &*self.lock() {
            PipelineStatus::Failed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.lock().is_failed()
    }

    /// Fail fast once the latch is tripped.
    ///
    /// The error names the latched cause but is reported as
    /// [`EngineError::Faulted`], so callers can tell an observer from the root.
    pub fn check(&self) -> Result<()> {
        match self.failure() {
            Some(cause) => Err(EngineError::Faulted(cause.to_string())),
            None => Ok(()),
        }
    }
}
