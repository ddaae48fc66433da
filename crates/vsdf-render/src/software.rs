//! Software renderer with an asynchronous device queue.
//!
//! Submissions are queued to a dedicated `vsdf-device` thread over an
//! unbounded `tokio::sync::mpsc` channel, mirroring a GPU command queue: the
//! submitting thread never waits for shading to finish.  Each job writes into
//! the target's shared image memory and then completes its fence.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use vsdf_core::codec_traits::{FrameRenderer, RenderTarget};
use vsdf_core::error::{EngineError, Result};
use vsdf_core::signal::{CompletionHandle, CompletionSignal};
use vsdf_core::types::{FrameExtent, PixelLayout};

use crate::scene::{Scene, Uniforms, to_unorm8};

/// Row alignment of readback buffers, in bytes.
pub const ROW_ALIGNMENT: usize = 256;

/// Padded row size for a BGRA8 image of `width` pixels.
pub const fn aligned_row_stride(width: u32) -> usize {
    let tight = PixelLayout::Bgra8.row_bytes(width);
    tight.div_ceil(ROW_ALIGNMENT) * ROW_ALIGNMENT
}

type ImageMemory = Arc<Mutex<Vec<u8>>>;

fn lock(memory: &ImageMemory) -> MutexGuard<'_, Vec<u8>> {
    memory.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Image memory written by the device thread and mapped for readback.
#[derive(Debug)]
pub struct SoftwareTarget {
    slot_index: usize,
    stride: usize,
    memory: ImageMemory,
}

impl SoftwareTarget {
    pub fn slot_index(&self) -> usize {
        self.slot_index
    }
}

impl RenderTarget for SoftwareTarget {
    fn row_stride(&self) -> usize {
        self.stride
    }

    fn map_read(&self, visit: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        let memory = lock(&self.memory);
        visit(&memory)
    }
}

struct RenderJob {
    frame_index: u64,
    uniforms: Uniforms,
    memory: ImageMemory,
    stride: usize,
    done: CompletionHandle,
}

/// CPU implementation of [`FrameRenderer`].
pub struct SoftwareRenderer {
    extent: FrameExtent,
    scene: Scene,
    fps: u32,
    queue: Option<mpsc::UnboundedSender<RenderJob>>,
    device: Option<JoinHandle<u64>>,
    live_targets: usize,
}

impl SoftwareRenderer {
    /// Start the device thread. `fps` converts frame indices to scene time.
    pub fn new(extent: FrameExtent, scene: Scene, fps: u32) -> Result<Self> {
        let extent = extent.validate()?;
        if fps == 0 {
            return Err(EngineError::Configuration("fps must be positive".into()));
        }

        let (queue, jobs) = mpsc::unbounded_channel::<RenderJob>();
        let device = std::thread::Builder::new()
            .name("vsdf-device".into())
            .spawn(move || device_loop(jobs, extent, scene))
            .map_err(|e| EngineError::io("spawn render device thread", e))?;

        info!(%extent, %scene, fps, "Software renderer ready");
        Ok(Self {
            extent,
            scene,
            fps,
            queue: Some(queue),
            device: Some(device),
            live_targets: 0,
        })
    }

    pub fn scene(&self) -> Scene {
        self.scene
    }

    /// Targets created and not yet destroyed.
    pub fn live_targets(&self) -> usize {
        self.live_targets
    }

    /// Close the queue and wait for every submitted job to finish.
    fn wait_idle(&mut self) {
        drop(self.queue.take());
        if let Some(device) = self.device.take() {
            match device.join() {
                Ok(frames) => debug!(frames, "Device thread idle"),
                Err(_) => warn!("Device thread panicked"),
            }
        }
    }
}

impl FrameRenderer for SoftwareRenderer {
    type Target = SoftwareTarget;

    fn extent(&self) -> FrameExtent {
        self.extent
    }

    fn image_format(&self) -> PixelLayout {
        PixelLayout::Bgra8
    }

    fn create_target(&mut self, slot_index: usize) -> Result<SoftwareTarget> {
        let stride = aligned_row_stride(self.extent.width);
        let bytes = stride * self.extent.height as usize;
        self.live_targets += 1;
        debug!(slot = slot_index, stride, bytes, "Render target created");
        Ok(SoftwareTarget {
            slot_index,
            stride,
            memory: Arc::new(Mutex::new(vec![0; bytes])),
        })
    }

    fn submit_render(
        &mut self,
        target: &mut SoftwareTarget,
        frame_index: u64,
    ) -> Result<CompletionSignal> {
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| EngineError::Render("device queue already closed".into()))?;
        let (signal, done) = CompletionSignal::new();
        let job = RenderJob {
            frame_index,
            uniforms: Uniforms::for_frame(frame_index, self.fps, self.extent),
            memory: Arc::clone(&target.memory),
            stride: target.stride,
            done,
        };
        queue
            .send(job)
            .map_err(|_| EngineError::Render("device thread exited".into()))?;
        trace!(frame = frame_index, slot = target.slot_index, "Render queued");
        Ok(signal)
    }

    fn destroy_target(&mut self, target: SoftwareTarget) {
        self.live_targets = self.live_targets.saturating_sub(1);
        debug!(slot = target.slot_index, "Render target destroyed");
    }
}

impl Drop for SoftwareRenderer {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

fn device_loop(
    mut jobs: mpsc::UnboundedReceiver<RenderJob>,
    extent: FrameExtent,
    scene: Scene,
) -> u64 {
    let mut rendered = 0;
    while let Some(job) = jobs.blocking_recv() {
        if job.done.is_abandoned() {
            trace!(frame = job.frame_index, "Nobody waits for this frame; skipped");
            continue;
        }
        {
            let mut memory = lock(&job.memory);
            shade_into(&mut memory, job.stride, extent, scene, &job.uniforms);
        }
        job.done.complete();
        rendered += 1;
    }
    rendered
}

/// Shade every pixel as BGRA8. Row padding is left untouched.
fn shade_into(memory: &mut [u8], stride: usize, extent: FrameExtent, scene: Scene, u: &Uniforms) {
    let row_bytes = PixelLayout::Bgra8.row_bytes(extent.width);
    for (y, row) in memory
        .chunks_mut(stride)
        .take(extent.height as usize)
        .enumerate()
    {
        for (x, px) in row[..row_bytes].chunks_exact_mut(4).enumerate() {
            let [r, g, b] = scene.shade(x as u32, y as u32, u);
            px.copy_from_slice(&[to_unorm8(b), to_unorm8(g), to_unorm8(r), u8::MAX]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SoftwareRenderer, aligned_row_stride};
    use crate::scene::Scene;
    use vsdf_core::codec_traits::{FrameRenderer, RenderTarget};
    use vsdf_core::types::FrameExtent;

    #[test]
    fn rows_are_padded_to_the_copy_alignment() {
        assert_eq!(aligned_row_stride(64), 256);
        assert_eq!(aligned_row_stride(65), 512);
        assert_eq!(aligned_row_stride(1280), 5120);
    }

    #[test]
    fn quadrants_render_through_the_device_queue() {
        let mut renderer =
            SoftwareRenderer::new(FrameExtent::new(8, 4), Scene::Quadrants, 30).expect("renderer");
        let mut target = renderer.create_target(0).expect("target");
        assert_eq!(target.row_stride(), 256);

        renderer
            .submit_render(&mut target, 0)
            .expect("submit")
            .wait()
            .expect("fence");

        target
            .map_read(&mut |bytes| {
                // BGRA: top-left red, bottom-right blue.
                assert_eq!(&bytes[..4], &[0, 0, 255, 255]);
                let bottom_right = 3 * 256 + 7 * 4;
                assert_eq!(&bytes[bottom_right..bottom_right + 4], &[255, 0, 0, 255]);
                assert_eq!(bytes[8 * 4], 0, "padding untouched");
                Ok(())
            })
            .expect("map");
        renderer.destroy_target(target);
        assert_eq!(renderer.live_targets(), 0);
    }

    #[test]
    fn zero_fps_is_rejected() {
        assert!(SoftwareRenderer::new(FrameExtent::new(8, 8), Scene::Orbs, 0).is_err());
    }
}
