//! One-shot GPU completion fences.
//!
//! A renderer returns a [`CompletionSignal`] from every submission and keeps
//! the matching [`CompletionHandle`].  The pipeline only ever waits on the
//! signal; it never sets it.  The signal is consumed by `wait`, so a fence
//! cannot be waited on twice.
//!
//! Built on `tokio::sync::oneshot` and used from plain threads through
//! `blocking_recv`.  Waiting from inside an async runtime panics, so the
//! encode worker always runs on a dedicated OS thread.

use tokio::sync::oneshot;

use crate::error::{EngineError, Result};

/// Waitable side of a fence.
#[derive(Debug)]
pub struct CompletionSignal {
    rx: oneshot::Receiver<Result<()>>,
}

/// Signalling side of a fence, held by the renderer until the work finishes.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: oneshot::Sender<Result<()>>,
}

impl CompletionSignal {
    /// Create an unsignalled fence.
    pub fn new() -> (Self, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (Self { rx }, CompletionHandle { tx })
    }

    /// A fence that is already signalled, for renderers that finish synchronously.
    pub fn ready() -> Self {
        let (signal, handle) = Self::new();
        handle.complete();
        signal
    }

    /// A fence that already carries a failure.
    pub fn failed(err: EngineError) -> Self {
        let (signal, handle) = Self::new();
        handle.fail(err);
        signal
    }

    /// Block until the renderer signals the fence.
    ///
    /// A handle dropped without being signalled is reported as a render error
    /// so that a crashed device queue cannot hang the encode worker.
    pub fn wait(self) -> Result<()> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(EngineError::Render(
                "completion signal dropped before the GPU work finished".into(),
            )),
        }
    }
}

impl CompletionHandle {
    /// Mark the work as finished.
    pub fn complete(self) {
        // The pipeline may have stopped waiting after a fault.
        let _ = self.tx.send(Ok(()));
    }

    /// Mark the work as failed.
    pub fn fail(self, err: EngineError) {
        let _ = self.tx.send(Err(err));
    }

    /// `true` once nobody can observe this fence any more.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}
