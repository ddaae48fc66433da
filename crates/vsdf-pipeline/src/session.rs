//! Start/stop orchestration around the encode worker.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};
use vsdf_core::codec_traits::{FrameEncoder, RenderTarget};
use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::{PixelLayout, StreamSpec};

use crate::config::PipelineConfig;
use crate::latch::FaultLatch;
use crate::metrics::PipelineMetrics;
use crate::queue::{EncodeRequest, Rejected, WorkQueue, work_queue};
use crate::slot::SlotReturn;
use crate::worker::{self, SpawnFailed, WorkerContext, WorkerOutcome, panic_message};

/// A running encode worker plus the producer end of its queue.
///
/// Created by [`start_encoding`](Self::start_encoding); torn down by
/// [`stop_encoding`](Self::stop_encoding), or on drop.
pub struct EncodeSession<T, E>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    queue: Option<WorkQueue<T>>,
    worker: Option<JoinHandle<Option<WorkerOutcome<E>>>>,
    encoder: Option<E>,
    latch: Arc<FaultLatch>,
    stopped: bool,
}

fn as_open_error(err: EngineError) -> EngineError {
    match err {
        EngineError::EncoderOpen(_) => err,
        other => EngineError::EncoderOpen(other.to_string()),
    }
}

fn as_shutdown_error(err: EngineError) -> EngineError {
    match err {
        EngineError::Shutdown(_) => err,
        other => EngineError::Shutdown(other.to_string()),
    }
}

impl<T, E> EncodeSession<T, E>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    /// Open the encoder and spawn the worker.
    ///
    /// Every failure here is synchronous: the encoder is closed again and an
    /// [`EngineError::EncoderOpen`] (or `Configuration`) is returned before
    /// any frame could be accepted.
    pub fn start_encoding(
        mut encoder: E,
        spec: StreamSpec,
        source_layout: PixelLayout,
        config: &PipelineConfig,
        slot_return: SlotReturn<T>,
        latch: Arc<FaultLatch>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self> {
        config.validate_ring_size()?;
        spec.extent.validate()?;

        if let Err(e) = encoder.open(&spec) {
            let _ = encoder.close();
            return Err(as_open_error(e));
        }
        if let Some(dir) = &config.debug_dump_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                let _ = encoder.close();
                return Err(EngineError::EncoderOpen(format!(
                    "cannot create dump directory {}: {e}",
                    dir.display()
                )));
            }
            info!(dir = %dir.display(), "Debug PPM dump enabled; encode stalls on every frame");
        }

        let (queue, receiver) = work_queue(config.ring_size, latch.clone());
        let spawned = worker::spawn(WorkerContext {
            receiver,
            encoder,
            slot_return,
            latch: latch.clone(),
            metrics,
            spec,
            source_layout,
            dump_dir: config.debug_dump_dir.clone(),
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(SpawnFailed {
                cause,
                mut encoder,
            }) => {
                let _ = encoder.close();
                return Err(as_open_error(cause));
            }
        };

        info!(
            extent = %spec.extent,
            layout = ?spec.layout,
            ring_size = config.ring_size,
            "Encoding started"
        );
        Ok(Self {
            queue: Some(queue),
            worker: Some(handle),
            encoder: None,
            latch,
            stopped: false,
        })
    }

    /// Queue a frame for the worker, blocking while the queue is full.
    pub fn submit(&self, request: EncodeRequest<T>) -> std::result::Result<(), Rejected<T>> {
        match &self.queue {
            Some(queue) => queue.push(request),
            None => Err(Rejected {
                cause: EngineError::Faulted("encode session already stopped".into()),
                request,
            }),
        }
    }

    /// Requests waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.as_ref().map_or(0, WorkQueue::len)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Drain, join the worker and close the encoder.
    ///
    /// Already-queued frames are encoded and flushed unless the run has
    /// failed.  Returns the worker's root cause if there is one; otherwise a
    /// `close` failure as [`EngineError::Shutdown`].  A `close` failure never
    /// masks an earlier error.  Calling it again is a no-op.
    pub fn stop_encoding(&mut self) -> Result<()> {
        if self.stopped {
            debug!("stop_encoding: already stopped");
            return Ok(());
        }
        self.stopped = true;
        self.latch.begin_drain();

        // End of stream for the worker.
        drop(self.queue.take());

        let worker_result = match self.worker.take() {
            Some(handle) => match handle.join() {
                Ok(Some(outcome)) => {
                    self.encoder = Some(outcome.encoder);
                    outcome.result
                }
                Ok(None) => Err(self.latch.trip(EngineError::InvariantViolation(
                    "encode worker exited without its encoder".into(),
                ))),
                Err(payload) => Err(self.latch.trip(EngineError::PanicRecovered {
                    stage: "encode",
                    message: panic_message(payload.as_ref()),
                })),
            },
            None => Ok(0),
        };

        let close_result = match self.encoder.as_mut() {
            Some(encoder) => encoder.close().map_err(as_shutdown_error),
            None => Ok(()),
        };
        self.latch.mark_stopped();

        match (worker_result, close_result) {
            (Ok(frames), Ok(())) => {
                info!(frames, "Encoding stopped");
                Ok(())
            }
            (Ok(_), Err(close)) => Err(close),
            (Err(root), Ok(())) => Err(root),
            (Err(root), Err(close)) => {
                warn!(error = %close, root = %root, "Encoder close failed after an earlier error");
                Err(root)
            }
        }
    }
}

impl<T, E> Drop for EncodeSession<T, E>
where
    T: RenderTarget,
    E: FrameEncoder,
{
    fn drop(&mut self) {
        if let Err(e) = self.stop_encoding() {
            warn!(error = %e, "Encode session dropped with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EncodeSession;
    use crate::config::PipelineConfig;
    use crate::latch::FaultLatch;
    use crate::metrics::PipelineMetrics;
    use crate::slot::FrameSlot;
    use vsdf_core::codec_traits::{FrameEncoder, RenderTarget};
    use vsdf_core::error::{EngineError, Result};
    use vsdf_core::types::{FrameExtent, PixelLayout, StreamSpec};

    struct NullTarget;

    impl RenderTarget for NullTarget {
        fn row_stride(&self) -> usize {
            4
        }

        fn map_read(&self, visit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
            visit(&[0, 0, 0, 255])
        }
    }

    #[derive(Default)]
    struct CountingEncoder {
        fail_open: bool,
        fail_close: bool,
        closes: usize,
    }

    impl FrameEncoder for CountingEncoder {
        fn open(&mut self, _spec: &StreamSpec) -> Result<()> {
            if self.fail_open {
                return Err(EngineError::Io("no such codec".into()));
            }
            Ok(())
        }

        fn submit_frame(&mut self, _: &[u8], _: usize, _: u64) -> Result<()> {
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closes += 1;
            if self.fail_close {
                return Err(EngineError::Io("trailer write failed".into()));
            }
            Ok(())
        }
    }

    fn start(
        encoder: CountingEncoder,
    ) -> Result<EncodeSession<NullTarget, CountingEncoder>> {
        let (slot_return, _returns) = std::sync::mpsc::channel::<FrameSlot<NullTarget>>();
        EncodeSession::start_encoding(
            encoder,
            StreamSpec {
                extent: FrameExtent::new(1, 1),
                layout: PixelLayout::Bgra8,
            },
            PixelLayout::Bgra8,
            &PipelineConfig::new(1),
            slot_return,
            FaultLatch::new(),
            PipelineMetrics::new(),
        )
    }

    #[test]
    fn open_failure_is_reported_synchronously() {
        let err = start(CountingEncoder {
            fail_open: true,
            ..Default::default()
        })
        .err()
        .expect("open fails");
        assert!(matches!(err, EngineError::EncoderOpen(ref m) if m.contains("no such codec")));
    }

    #[test]
    fn stop_without_frames_is_clean_and_idempotent() {
        let mut session = start(CountingEncoder::default()).expect("start");
        assert_eq!(session.queued(), 0);
        session.stop_encoding().expect("first stop");
        session.stop_encoding().expect("second stop");
        assert!(session.is_stopped());
        assert_eq!(session.encoder.as_ref().map(|e| e.closes), Some(1));
    }

    #[test]
    fn close_failure_is_a_shutdown_error() {
        let mut session = start(CountingEncoder {
            fail_close: true,
            ..Default::default()
        })
        .expect("start");
        let err = session.stop_encoding().expect_err("close fails");
        assert_eq!(err.error_code(), 400);
    }
}
