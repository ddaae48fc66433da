//! Bounded FIFO of encode requests.
//!
//! Built on a `tokio::sync::mpsc` channel whose capacity equals the ring size,
//! used from plain threads with `blocking_send` / `blocking_recv`.  The
//! channel provides blocking and wake-ups.  The latch adds the
//! "closed with error" state:
//!
//! - `push` refuses to insert once the latch is tripped, and fails while
//!   blocked when the worker closes the receiver after a fault.
//! - `pop` reports end of stream once the producer has dropped its sender
//!   and the queue is empty, and the latched error once the run failed.

use std::sync::Arc;

use tokio::sync::mpsc;
use vsdf_core::error::{EngineError, Result};
use vsdf_core::signal::CompletionSignal;

use crate::latch::FaultLatch;
use crate::slot::FrameSlot;

/// One frame waiting to be encoded. Consumed exactly once by the worker.
#[derive(Debug)]
pub struct EncodeRequest<T> {
    frame_index: u64,
    slot: FrameSlot<T>,
    completion: CompletionSignal,
}

impl<T> EncodeRequest<T> {
    pub fn new(frame_index: u64, slot: FrameSlot<T>, completion: CompletionSignal) -> Self {
        Self {
            frame_index,
            slot,
            completion,
        }
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn slot_index(&self) -> usize {
        self.slot.index()
    }

    pub fn into_parts(self) -> (u64, FrameSlot<T>, CompletionSignal) {
        (self.frame_index, self.slot, self.completion)
    }
}

/// A request the queue refused, handed back so its slot can be recovered.
#[derive(Debug)]
pub struct Rejected<T> {
    pub cause: EngineError,
    pub request: EncodeRequest<T>,
}

/// Create a queue holding at most `capacity` requests.
pub fn work_queue<T>(capacity: usize, latch: Arc<FaultLatch>) -> (WorkQueue<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        WorkQueue {
            tx,
            latch: latch.clone(),
        },
        WorkReceiver { rx, latch },
    )
}

/// Producer side. Dropping it marks the end of the stream.
pub struct WorkQueue<T> {
    tx: mpsc::Sender<EncodeRequest<T>>,
    latch: Arc<FaultLatch>,
}

impl<T> WorkQueue<T> {
    /// Append `request`, blocking while the queue is full.
    pub fn push(&self, request: EncodeRequest<T>) -> std::result::Result<(), Rejected<T>> {
        if let Err(cause) = self.latch.check() {
            return Err(Rejected { cause, request });
        }
        self.tx.blocking_send(request).map_err(|mpsc::error::SendError(request)| {
            let cause = self.latch.check().err().unwrap_or_else(|| {
                EngineError::Faulted("encode queue closed".into())
            });
            Rejected { cause, request }
        })
    }

    /// Requests currently queued and not yet dequeued.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// Consumer side, owned by the encode worker.
pub struct WorkReceiver<T> {
    rx: mpsc::Receiver<EncodeRequest<T>>,
    latch: Arc<FaultLatch>,
}

impl<T> WorkReceiver<T> {
    /// Next request in FIFO order, `None` at end of stream.
    ///
    /// A request is still returned if the latch trips while waiting, so that
    /// its slot can be handed back.  The caller re-checks the latch before
    /// using it.
    pub fn pop(&mut self) -> Result<Option<EncodeRequest<T>>> {
        if let Some(cause) = self.latch.failure() {
            return Err(cause);
        }
        match self.rx.blocking_recv() {
            Some(request) => Ok(Some(request)),
            None => match self.latch.failure() {
                Some(cause) => Err(cause),
                None => Ok(None),
            },
        }
    }

    /// Refuse further pushes and take everything still queued.
    ///
    /// Waits for pushes that were already in progress when the queue closed,
    /// so no request is left behind in the channel.
    pub fn close_and_drain(&mut self) -> Vec<EncodeRequest<T>> {
        self.rx.close();
        let mut pending = Vec::new();
        while let Some(request) = self.rx.blocking_recv() {
            pending.push(request);
        }
        pending
    }
}
