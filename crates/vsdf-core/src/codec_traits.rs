//! Collaborator traits used across crate boundaries.
//!
//! These traits let `vsdf-pipeline` sequence rendering and encoding without
//! depending on `vsdf-render` or `vsdf-ffmpeg`.  Both sides are opaque to the
//! pipeline: it only moves targets around, waits on fences and hands
//! normalized pixel buffers to the encoder.

use crate::error::Result;
use crate::signal::CompletionSignal;
use crate::types::{FrameExtent, PixelLayout, StreamSpec};

// ─── Renderer side ───────────────────────────────────────────────────────────

/// GPU-owned image memory plus its CPU-visible readback copy.
///
/// One target backs one ring slot for the whole run.  The renderer writes it
/// asynchronously after [`FrameRenderer::submit_render`]; the pipeline reads it
/// only after the returned [`CompletionSignal`] fired.
pub trait RenderTarget: Send + 'static {
    /// Row stride of the mapped readback buffer in bytes.
    ///
    /// May exceed `width × bytes_per_pixel` when the device pads rows.
    fn row_stride(&self) -> usize;

    /// Borrow the mapped readback buffer for the duration of `visit`.
    fn map_read(&self, visit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()>;
}

/// Produces pixel data for a frame index into a [`RenderTarget`].
pub trait FrameRenderer {
    type Target: RenderTarget;

    /// Size of every rendered image.
    fn extent(&self) -> FrameExtent;

    /// Layout of the mapped readback buffers.
    fn image_format(&self) -> PixelLayout;

    /// Allocate the target for ring slot `slot_index`. Called only during setup.
    fn create_target(&mut self, slot_index: usize) -> Result<Self::Target>;

    /// Record and submit the work for `frame_index` into `target`.
    ///
    /// Must not wait for the work to finish: completion is reported through
    /// the returned signal.
    fn submit_render(
        &mut self,
        target: &mut Self::Target,
        frame_index: u64,
    ) -> Result<CompletionSignal>;

    /// Release a target. Called exactly once per target, during teardown.
    fn destroy_target(&mut self, target: Self::Target) {
        drop(target);
    }
}

// ─── Encoder side ────────────────────────────────────────────────────────────

/// Consumes raw pixel buffers in frame order and produces an output stream.
pub trait FrameEncoder: Send + 'static {
    /// Layout this encoder wants for frames rendered in `source` layout.
    ///
    /// Queried once at setup, before [`open`](Self::open).
    fn preferred_layout(&self, source: PixelLayout) -> PixelLayout {
        source
    }

    /// Prepare the output stream. Failure aborts setup before any frame is rendered.
    fn open(&mut self, spec: &StreamSpec) -> Result<()>;

    /// Encode one frame of `spec.layout` pixels with the given row stride.
    fn submit_frame(&mut self, pixels: &[u8], row_stride: usize, frame_index: u64) -> Result<()>;

    /// Drain internally buffered frames and finalise the stream.
    fn flush(&mut self) -> Result<()>;

    /// Release every resource. Idempotent and safe to call after a failure.
    fn close(&mut self) -> Result<()>;
}
