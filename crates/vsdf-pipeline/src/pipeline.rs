//! Render driver for the offline mode.
//!
//! # Architecture
//!
//! The caller's thread is the producer.  For every frame index it takes the
//! slot `frame % ring_size`, submits the render into it without waiting for
//! the GPU, and queues an encode request that carries the slot.  The encode
//! worker (see [`EncodeSession`]) waits for the fence, reads the slot back,
//! encodes it and returns the slot.
//!
//! # Backpressure
//!
//! The producer blocks in exactly two places: waiting for its next slot to
//! come back, and pushing into the full work queue.  Both are bounded by
//! `ring_size`, so the renderer can never run more than `ring_size` frames
//! ahead of the encoder.
//!
//! # Shutdown
//!
//! [`RingPipeline::run`] always stops the session and destroys every slot
//! target it can reclaim, success or not.  It reports one error: the
//! latched root cause if the run failed, otherwise a shutdown error.  A
//! pipeline dropped without running destroys its targets on drop.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, instrument, trace, warn};
use vsdf_core::codec_traits::{FrameEncoder, FrameRenderer};
use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::StreamSpec;

use crate::config::PipelineConfig;
use crate::latch::{FaultLatch, PipelineStatus};
use crate::metrics::{PipelineMetrics, RunReport, micros};
use crate::queue::EncodeRequest;
use crate::session::EncodeSession;
use crate::slot::SlotPool;

/// States of the producer loop, traced per frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerPhase {
    Idle,
    WaitSlotFree,
    Submit,
    Enqueued,
    Draining,
}

/// Offline render → readback → encode pipeline over a fixed ring of slots.
pub struct RingPipeline<R: FrameRenderer> {
    renderer: R,
    config: PipelineConfig,
    /// `None` once the targets have been destroyed.
    pool: Option<SlotPool<R::Target>>,
    latch: Arc<FaultLatch>,
    metrics: Arc<PipelineMetrics>,
}

impl<R: FrameRenderer> RingPipeline<R> {
    /// Validate `config` and allocate one render target per slot.
    ///
    /// Configuration errors are returned before the renderer is touched.
    pub fn new(mut renderer: R, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        renderer.extent().validate()?;

        let mut targets = Vec::with_capacity(config.ring_size);
        for slot_index in 0..config.ring_size {
            match renderer.create_target(slot_index) {
                Ok(target) => targets.push(target),
                Err(e) => {
                    for target in targets {
                        renderer.destroy_target(target);
                    }
                    return Err(e);
                }
            }
        }
        debug!(
            ring_size = config.ring_size,
            extent = %renderer.extent(),
            "Slots allocated"
        );

        let latch = FaultLatch::new();
        Ok(Self {
            renderer,
            pool: Some(SlotPool::new(targets, latch.clone())),
            config,
            latch,
            metrics: PipelineMetrics::new(),
        })
    }

    /// Shared counters, readable while the run is in progress.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.latch.status()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Render `total_frames` frames and encode them in order with `encoder`.
    ///
    /// # Shutdown guarantee
    ///
    /// When this function returns, the worker thread is joined, the encoder
    /// is closed and every reclaimed slot target has been destroyed.
    #[instrument(skip_all, name = "ring_pipeline")]
    pub fn run<E: FrameEncoder>(mut self, encoder: E) -> Result<RunReport> {
        let started = Instant::now();
        let source_layout = self.renderer.image_format();
        let spec = StreamSpec {
            extent: self.renderer.extent(),
            layout: encoder.preferred_layout(source_layout),
        };
        info!(
            frames = self.config.total_frames,
            ring_size = self.config.ring_size,
            extent = %spec.extent,
            "Offline render starting"
        );
        debug!(source = ?source_layout, output = ?spec.layout, "Pixel layout negotiated");

        let session = self.pool_mut()?.take_return_sender().and_then(|slot_return| {
            EncodeSession::start_encoding(
                encoder,
                spec,
                source_layout,
                &self.config,
                slot_return,
                self.latch.clone(),
                self.metrics.clone(),
            )
        });
        let mut session = match session {
            Ok(session) => session,
            Err(e) => {
                self.teardown();
                return Err(e);
            }
        };

        let produced = self.produce(&session);
        if let Err(e) = &produced {
            self.latch.trip(e.clone());
        }

        trace!(phase = ?ProducerPhase::Draining);
        let stopped = session.stop_encoding();
        drop(session);

        let ring_size = self.config.ring_size;
        let metrics = self.metrics.clone();
        let root = self.latch.failure();
        self.teardown();

        if let Some(root) = root {
            if let Err(e) = produced {
                debug!(producer_error = %e, "Producer stopped by the fault");
            }
            return Err(root);
        }
        stopped?;
        metrics.enforce()?;
        metrics.report();

        let report = metrics.snapshot(ring_size, started.elapsed());
        info!(
            frames = report.frames_encoded,
            elapsed_ms = report.elapsed_ms,
            fps = report.throughput_fps(),
            "Offline render complete"
        );
        Ok(report)
    }

    /// The producer loop. Returns on the first error without issuing further frames.
    fn produce<E: FrameEncoder>(&mut self, session: &EncodeSession<R::Target, E>) -> Result<()> {
        let Some(pool) = self.pool.as_mut() else {
            return Err(EngineError::InvariantViolation(
                "slot targets already destroyed".into(),
            ));
        };
        for frame_index in 0..self.config.total_frames {
            trace!(frame = frame_index, phase = ?ProducerPhase::WaitSlotFree);
            let waited = Instant::now();
            let mut slot = pool.acquire_for_render(frame_index)?;
            self.metrics
                .slot_wait_us
                .fetch_add(micros(waited.elapsed()), Ordering::Relaxed);
            if let Err(e) = self.latch.check() {
                pool.restore(slot);
                return Err(e);
            }

            trace!(frame = frame_index, slot = slot.index(), phase = ?ProducerPhase::Submit);
            let submitted = Instant::now();
            let completion = match self.renderer.submit_render(slot.target_mut(), frame_index) {
                Ok(completion) => completion,
                Err(e) => {
                    pool.restore(slot);
                    return Err(e);
                }
            };
            self.metrics
                .submit_total_us
                .fetch_add(micros(submitted.elapsed()), Ordering::Relaxed);
            self.metrics.frames_submitted.fetch_add(1, Ordering::Release);

            trace!(frame = frame_index, slot = slot.index(), phase = ?ProducerPhase::Enqueued);
            self.metrics.slot_queued();
            if let Err(rejected) = session.submit(EncodeRequest::new(frame_index, slot, completion)) {
                self.metrics.slot_freed();
                self.metrics.frames_discarded.fetch_add(1, Ordering::AcqRel);
                let (_, slot, completion) = rejected.request.into_parts();
                // The render is already in flight; let it land before the slot is reused.
                let _ = completion.wait();
                pool.restore(slot);
                return Err(rejected.cause);
            }
        }
        trace!(phase = ?ProducerPhase::Idle, "All frames queued");
        Ok(())
    }

    fn pool_mut(&mut self) -> Result<&mut SlotPool<R::Target>> {
        self.pool.as_mut().ok_or_else(|| {
            EngineError::InvariantViolation("slot targets already destroyed".into())
        })
    }

    /// Destroy every slot target that made it back to the pool. Runs once.
    fn teardown(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let targets = pool.reclaim();
        let destroyed = targets.len();
        for target in targets {
            self.renderer.destroy_target(target);
        }
        if destroyed == 0 {
            warn!("No slot targets to destroy");
        } else {
            debug!(destroyed, "Slot targets destroyed");
        }
    }
}

impl<R: FrameRenderer> Drop for RingPipeline<R> {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl<R: FrameRenderer> std::fmt::Debug for RingPipeline<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingPipeline")
            .field("config", &self.config)
            .field("status", &self.latch.status())
            .field(
                "pending_slots",
                &self.pool.as_ref().map_or(0, SlotPool::pending_count),
            )
            .finish_non_exhaustive()
    }
}
