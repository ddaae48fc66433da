//! Encode worker.
//!
//! Runs on its own OS thread (`vsdf-encode`) because every wait it performs
//! is a blocking call: `blocking_recv` on the work queue and on completion
//! signals, plus whatever the encoder does internally.
//!
//! ```text
//! WaitRequest ─► WaitGpuDone ─► Readback ─► Encode ─► Free ─┐
//!     ▲                                                     │
//!     └─────────────────────────────────────────────────────┘
//! WaitRequest ─(end of stream)─► Flush
//! any step ─(error)─► FailStop
//! ```
//!
//! `FailStop` trips the latch before it returns a single slot, so a producer
//! woken by a returned slot always sees the failure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, info, trace, warn};
use vsdf_core::codec_traits::{FrameEncoder, RenderTarget};
use vsdf_core::error::{EngineError, Result};
use vsdf_core::image_dump::write_ppm;
use vsdf_core::signal::CompletionSignal;
use vsdf_core::types::{PixelLayout, StreamSpec};

use crate::latch::FaultLatch;
use crate::metrics::{PipelineMetrics, micros};
use crate::queue::WorkReceiver;
use crate::readback::{normalize_frame, to_rgb_frame};
use crate::slot::{FrameSlot, SlotReturn};

/// States of the encode worker, traced per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerPhase {
    WaitRequest,
    WaitGpuDone,
    Readback,
    Encode,
    Free,
    Flush,
    FailStop,
}

/// Everything the worker takes ownership of when it starts.
pub(crate) struct WorkerContext<T, E> {
    pub receiver: WorkReceiver<T>,
    pub encoder: E,
    pub slot_return: SlotReturn<T>,
    pub latch: Arc<FaultLatch>,
    pub metrics: Arc<PipelineMetrics>,
    pub spec: StreamSpec,
    pub source_layout: PixelLayout,
    pub dump_dir: Option<PathBuf>,
}

/// What the thread hands back when joined. The encoder survives failures
/// and panics so that it can still be closed.
pub(crate) struct WorkerOutcome<E> {
    pub encoder: E,
    pub result: Result<u64>,
}

/// The worker thread could not be started. The encoder was never moved onto
/// it and comes back here so it can still be closed.
pub(crate) struct SpawnFailed<E> {
    pub cause: EngineError,
    pub encoder: E,
}

pub(crate) fn spawn<T, E>(
    context: WorkerContext<T, E>,
) -> std::result::Result<JoinHandle<Option<WorkerOutcome<E>>>, SpawnFailed<E>>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    spawn_on(thread::Builder::new().name("vsdf-encode".into()), context)
}

/// Start the thread first and hand it the context afterwards.
///
/// The thread yields `None` only if it never received its context.
pub(crate) fn spawn_on<T, E>(
    builder: thread::Builder,
    context: WorkerContext<T, E>,
) -> std::result::Result<JoinHandle<Option<WorkerOutcome<E>>>, SpawnFailed<E>>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    let (hand_off, inbox) = mpsc::sync_channel::<WorkerContext<T, E>>(1);
    let handle = match builder.spawn(move || {
        inbox
            .recv()
            .ok()
            .map(|context| EncodeWorker::new(context).run())
    }) {
        Ok(handle) => handle,
        Err(e) => {
            return Err(SpawnFailed {
                cause: EngineError::io("spawn encode worker", e),
                encoder: context.encoder,
            });
        }
    };
    if let Err(mpsc::SendError(context)) = hand_off.send(context) {
        let _ = handle.join();
        return Err(SpawnFailed {
            cause: EngineError::InvariantViolation("encode worker exited before it started".into()),
            encoder: context.encoder,
        });
    }
    Ok(handle)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}

struct EncodeWorker<T, E> {
    receiver: WorkReceiver<T>,
    encoder: E,
    slot_return: SlotReturn<T>,
    latch: Arc<FaultLatch>,
    metrics: Arc<PipelineMetrics>,
    spec: StreamSpec,
    source_layout: PixelLayout,
    dump_dir: Option<PathBuf>,
    /// Slot of the frame currently being processed.
    in_hand: Option<FrameSlot<T>>,
    /// Fence of the frame in hand, until it has been waited on.
    pending_fence: Option<CompletionSignal>,
    /// Normalized pixels handed to the encoder, reused across frames.
    scratch: Vec<u8>,
    next_frame: u64,
}

impl<T, E> EncodeWorker<T, E>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    fn new(context: WorkerContext<T, E>) -> Self {
        Self {
            scratch: Vec::with_capacity(context.spec.frame_bytes()),
            receiver: context.receiver,
            encoder: context.encoder,
            slot_return: context.slot_return,
            latch: context.latch,
            metrics: context.metrics,
            spec: context.spec,
            source_layout: context.source_layout,
            dump_dir: context.dump_dir,
            in_hand: None,
            pending_fence: None,
            next_frame: 0,
        }
    }

    fn run(mut self) -> WorkerOutcome<E> {
        debug!(
            extent = %self.spec.extent,
            layout = ?self.spec.layout,
            "Encode worker started"
        );
        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.encode_loop())) {
            Ok(result) => result,
            Err(payload) => Err(EngineError::PanicRecovered {
                stage: "encode",
                message: panic_message(payload.as_ref()),
            }),
        };
        let result = match result {
            Ok(frames) => Ok(frames),
            Err(err) => Err(self.fail_stop(err)),
        };
        WorkerOutcome {
            encoder: self.encoder,
            result,
        }
    }

    fn encode_loop(&mut self) -> Result<u64> {
        loop {
            trace!(frame = self.next_frame, phase = ?WorkerPhase::WaitRequest);
            let Some(request) = self.receiver.pop()? else {
                return self.flush();
            };
            let (frame_index, slot, completion) = request.into_parts();
            let slot_index = slot.index();
            self.in_hand = Some(slot);
            self.pending_fence = Some(completion);
            self.latch.check()?;
            if frame_index != self.next_frame {
                return Err(EngineError::InvariantViolation(format!(
                    "encode order broken: expected frame {}, dequeued {frame_index}",
                    self.next_frame
                )));
            }

            trace!(frame = frame_index, slot = slot_index, phase = ?WorkerPhase::WaitGpuDone);
            let started = Instant::now();
            if let Some(fence) = self.pending_fence.take() {
                fence.wait()?;
            }
            self.metrics
                .gpu_wait_us
                .fetch_add(micros(started.elapsed()), Ordering::Relaxed);

            trace!(frame = frame_index, slot = slot_index, phase = ?WorkerPhase::Readback);
            let started = Instant::now();
            self.read_back(frame_index)?;
            self.metrics
                .readback_total_us
                .fetch_add(micros(started.elapsed()), Ordering::Relaxed);

            trace!(frame = frame_index, slot = slot_index, phase = ?WorkerPhase::Encode);
            self.latch.check()?;
            let started = Instant::now();
            self.encoder
                .submit_frame(&self.scratch, self.spec.row_stride(), frame_index)?;
            self.metrics
                .encode_total_us
                .fetch_add(micros(started.elapsed()), Ordering::Relaxed);
            self.metrics.frames_encoded.fetch_add(1, Ordering::Release);

            trace!(frame = frame_index, slot = slot_index, phase = ?WorkerPhase::Free);
            self.next_frame += 1;
            self.free_slot();
        }
    }

    /// Normalize the slot in hand into `scratch`, and dump it when asked.
    fn read_back(&mut self, frame_index: u64) -> Result<()> {
        let Self {
            in_hand,
            scratch,
            spec,
            source_layout,
            dump_dir,
            ..
        } = self;
        let slot = in_hand.as_ref().ok_or_else(|| {
            EngineError::InvariantViolation("readback without a slot in hand".into())
        })?;
        let target = slot.target();
        let stride = target.row_stride();
        let mut dump = None;
        target.map_read(&mut |bytes| {
            normalize_frame(
                bytes,
                stride,
                *source_layout,
                spec.extent,
                spec.layout,
                scratch,
            )?;
            if dump_dir.is_some() {
                dump = Some(to_rgb_frame(bytes, stride, *source_layout, spec.extent)?);
            }
            Ok(())
        })?;

        if let (Some(dir), Some(frame)) = (dump_dir.as_ref(), dump) {
            let path = dir.join(format!("frame_{frame_index:04}.ppm"));
            write_ppm(&frame, &path)?;
            debug!(frame = frame_index, path = %path.display(), "Dumped frame");
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<u64> {
        trace!(frames = self.next_frame, phase = ?WorkerPhase::Flush);
        self.encoder.flush()?;
        info!(frames = self.next_frame, "Encode: EOS, flushed");
        Ok(self.next_frame)
    }

    fn free_slot(&mut self) {
        if let Some(slot) = self.in_hand.take() {
            self.metrics.slot_freed();
            if self.slot_return.send(slot).is_err() {
                debug!("Slot pool gone; slot released with the worker");
            }
        }
    }

    /// Latch `err`, discard queued work and hand every slot back.
    ///
    /// Discarded frames are never encoded, but their render work is allowed
    /// to finish before the slot is released.
    fn fail_stop(&mut self, err: EngineError) -> EngineError {
        let root = self.latch.trip(err);
        trace!(frame = self.next_frame, phase = ?WorkerPhase::FailStop);

        let pending = self.receiver.close_and_drain();
        let mut discarded = pending.len() as u64;
        for request in pending {
            let (frame_index, slot, completion) = request.into_parts();
            if let Err(e) = completion.wait() {
                debug!(frame = frame_index, error = %e, "Discarded frame failed to render");
            }
            self.metrics.slot_freed();
            let _ = self.slot_return.send(slot);
        }

        if let Some(fence) = self.pending_fence.take() {
            let _ = fence.wait();
        }
        if self.in_hand.is_some() {
            discarded += 1;
            self.free_slot();
        }
        self.metrics
            .frames_discarded
            .fetch_add(discarded, Ordering::AcqRel);
        warn!(
            encoded = self.next_frame,
            discarded,
            error = %root,
            "Encode worker stopped after fault"
        );
        root
    }
}

#[cfg(test)]
mod tests {
    use super::{SpawnFailed, WorkerContext, panic_message, spawn_on};
    use crate::latch::FaultLatch;
    use crate::metrics::PipelineMetrics;
    use crate::queue::work_queue;
    use vsdf_core::codec_traits::{FrameEncoder, RenderTarget};
    use vsdf_core::error::Result;
    use vsdf_core::types::{FrameExtent, PixelLayout, StreamSpec};

    struct Pixel;

    impl RenderTarget for Pixel {
        fn row_stride(&self) -> usize {
            4
        }

        fn map_read(&self, visit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
            visit(&[0, 0, 0, 255])
        }
    }

    #[derive(Default)]
    struct Tally {
        frames: u64,
        flushes: usize,
    }

    impl FrameEncoder for Tally {
        fn open(&mut self, _spec: &StreamSpec) -> Result<()> {
            Ok(())
        }

        fn submit_frame(&mut self, _: &[u8], _: usize, _: u64) -> Result<()> {
            self.frames += 1;
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.flushes += 1;
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn context(latch: std::sync::Arc<FaultLatch>) -> WorkerContext<Pixel, Tally> {
        let (queue, receiver) = work_queue::<Pixel>(1, latch.clone());
        drop(queue);
        let (slot_return, _) = std::sync::mpsc::channel();
        WorkerContext {
            receiver,
            encoder: Tally::default(),
            slot_return,
            latch,
            metrics: PipelineMetrics::new(),
            spec: StreamSpec {
                extent: FrameExtent::new(1, 1),
                layout: PixelLayout::Bgra8,
            },
            source_layout: PixelLayout::Bgra8,
            dump_dir: None,
        }
    }

    #[test]
    fn worker_receives_its_context_after_the_thread_starts() {
        let handle = spawn_on(std::thread::Builder::new(), context(FaultLatch::new()))
            .map_err(|failed| failed.cause)
            .expect("spawn");
        let outcome = handle.join().expect("join").expect("context delivered");
        assert_eq!(outcome.result.expect("empty stream"), 0);
        assert_eq!(outcome.encoder.flushes, 1);
        assert_eq!(outcome.encoder.frames, 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_spawn_hands_the_encoder_back() {
        // No address space can hold this stack.
        let builder = std::thread::Builder::new().stack_size(1 << 60);
        let Err(SpawnFailed { cause, encoder }) = spawn_on(builder, context(FaultLatch::new()))
        else {
            panic!("spawn with an impossible stack succeeded");
        };
        assert_eq!(cause.error_code(), 501);
        assert_eq!(encoder.flushes, 0);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).expect_err("panic");
        assert_eq!(panic_message(payload.as_ref()), "static message");

        let payload =
            std::panic::catch_unwind(|| panic!("frame {}", 3)).expect_err("formatted panic");
        assert_eq!(panic_message(payload.as_ref()), "frame 3");
    }
}
