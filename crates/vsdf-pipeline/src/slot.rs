//! Frame slots and the producer-side slot pool.
//!
//! A [`FrameSlot`] is a move-only token that owns one render target.  While
//! the producer holds it, the producer may render into it.  Queuing a frame
//! moves the slot into the [`EncodeRequest`](crate::queue::EncodeRequest), so
//! the producer cannot touch the target again until the worker sends the slot
//! back over the return channel.  "Pending encode" is therefore simply
//! "not in the pool".

use std::sync::Arc;
use std::sync::mpsc;

use tracing::{debug, warn};
use vsdf_core::error::{EngineError, Result};

use crate::latch::FaultLatch;

/// One reusable ring slot.
#[derive(Debug)]
pub struct FrameSlot<T> {
    index: usize,
    target: T,
}

impl<T> FrameSlot<T> {
    pub(crate) fn new(index: usize, target: T) -> Self {
        Self { index, target }
    }

    /// Position of this slot in the ring, `0..ring_size`.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }
}

/// Sending half of the slot return channel. Held only by the encode worker.
pub type SlotReturn<T> = mpsc::Sender<FrameSlot<T>>;

/// Producer-side view of the ring.
///
/// The pool never allocates after construction.  It only parks slots that
/// have come back from the worker until the producer needs them.
pub struct SlotPool<T> {
    parked: Vec<Option<FrameSlot<T>>>,
    returns: mpsc::Receiver<FrameSlot<T>>,
    return_tx: Option<SlotReturn<T>>,
    latch: Arc<FaultLatch>,
}

impl<T> SlotPool<T> {
    /// Wrap pre-allocated targets. Slot `i` owns `targets[i]`.
    pub fn new(targets: Vec<T>, latch: Arc<FaultLatch>) -> Self {
        let (return_tx, returns) = mpsc::channel();
        let parked = targets
            .into_iter()
            .enumerate()
            .map(|(index, target)| Some(FrameSlot::new(index, target)))
            .collect();
        Self {
            parked,
            returns,
            return_tx: Some(return_tx),
            latch,
        }
    }

    pub fn ring_size(&self) -> usize {
        self.parked.len()
    }

    /// Hand the return channel to the encode worker. Succeeds once.
    ///
    /// The pool keeps no sender of its own, so once the worker exits a
    /// blocked [`acquire_for_render`](Self::acquire_for_render) wakes up
    /// instead of waiting forever.
    pub fn take_return_sender(&mut self) -> Result<SlotReturn<T>> {
        self.return_tx.take().ok_or_else(|| {
            EngineError::InvariantViolation("slot return channel already handed out".into())
        })
    }

    /// `true` while slot `index` is queued for encode or being encoded.
    pub fn is_pending(&self, index: usize) -> bool {
        self.parked.get(index).is_some_and(Option::is_none)
    }

    /// Number of slots currently out of the pool.
    pub fn pending_count(&self) -> usize {
        self.parked.iter().filter(|slot| slot.is_none()).count()
    }

    /// Take slot `frame_index % ring_size`, blocking until the worker has
    /// returned it.
    ///
    /// Fails fast when the latch trips while waiting, or when the worker
    /// exited without returning the slot.
    pub fn acquire_for_render(&mut self, frame_index: u64) -> Result<FrameSlot<T>> {
        let index = (frame_index % self.ring_size() as u64) as usize;
        loop {
            if let Some(slot) = self.parked[index].take() {
                return Ok(slot);
            }
            let returned = self.returns.recv().map_err(|_| {
                self.latch.check().err().unwrap_or_else(|| {
                    EngineError::Faulted("encode worker exited while slots were pending".into())
                })
            })?;
            self.park(returned);
            self.latch.check()?;
        }
    }

    /// Put back a slot the producer took but could not queue.
    pub fn restore(&mut self, slot: FrameSlot<T>) {
        self.park(slot);
    }

    fn park(&mut self, slot: FrameSlot<T>) {
        let index = slot.index;
        match self.parked.get_mut(index) {
            Some(entry) if entry.is_none() => *entry = Some(slot),
            Some(_) => warn!(slot = index, "Slot returned twice; dropping duplicate"),
            None => warn!(slot = index, "Slot index out of range; dropping"),
        }
    }

    /// Collect every target for teardown, including slots still in flight on
    /// the return channel.  Call after the encode worker has been joined.
    pub fn reclaim(mut self) -> Vec<T> {
        while let Ok(slot) = self.returns.try_recv() {
            self.park(slot);
        }
        let ring_size = self.ring_size();
        let targets: Vec<T> = self
            .parked
            .into_iter()
            .flatten()
            .map(FrameSlot::into_target)
            .collect();
        if targets.len() < ring_size {
            warn!(
                reclaimed = targets.len(),
                ring_size, "Some slots were lost with the encode worker"
            );
        } else {
            debug!(ring_size, "All slots reclaimed");
        }
        targets
    }
}
