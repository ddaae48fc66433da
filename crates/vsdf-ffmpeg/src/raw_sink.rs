//! Raw-video file sink.
//!
//! Writes every frame as tightly packed rows of the negotiated layout, with
//! no header.  Playable with e.g.
//!
//! ```bash
//! ffplay -f rawvideo -pixel_format bgra -video_size 1280x720 out.raw
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, info};
use vsdf_core::codec_traits::FrameEncoder;
use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::{PixelLayout, StreamSpec};

use crate::write_tight_rows;

/// Writes raw frames to a file.
pub struct RawVideoEncoder {
    path: PathBuf,
    layout: Option<PixelLayout>,
    writer: Option<BufWriter<File>>,
    spec: Option<StreamSpec>,
    next_frame: u64,
    bytes_written: u64,
}

impl RawVideoEncoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            layout: None,
            writer: None,
            spec: None,
            next_frame: 0,
            bytes_written: 0,
        }
    }

    /// Require frames in `layout` instead of the renderer's native layout.
    pub fn with_layout(mut self, layout: PixelLayout) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn frames_written(&self) -> u64 {
        self.next_frame
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl FrameEncoder for RawVideoEncoder {
    fn preferred_layout(&self, source: PixelLayout) -> PixelLayout {
        self.layout.unwrap_or(source)
    }

    fn open(&mut self, spec: &StreamSpec) -> Result<()> {
        if let Some(required) = self.layout {
            if required != spec.layout {
                return Err(EngineError::FormatMismatch {
                    expected: required,
                    actual: spec.layout,
                });
            }
        }
        if self.path.as_os_str().is_empty() {
            return Err(EngineError::EncoderOpen("output path is empty".into()));
        }
        let file = File::create(&self.path).map_err(|e| {
            EngineError::EncoderOpen(format!("cannot create {}: {e}", self.path.display()))
        })?;
        self.writer = Some(BufWriter::with_capacity(4 * 1024 * 1024, file)); // 4 MiB buffer
        self.spec = Some(*spec);
        self.next_frame = 0;
        self.bytes_written = 0;
        info!(
            path = %self.path.display(),
            extent = %spec.extent,
            layout = ?spec.layout,
            "Raw video sink opened"
        );
        Ok(())
    }

    fn submit_frame(&mut self, pixels: &[u8], row_stride: usize, frame_index: u64) -> Result<()> {
        let (Some(writer), Some(spec)) = (self.writer.as_mut(), self.spec.as_ref()) else {
            return Err(EngineError::Encode("raw video sink is not open".into()));
        };
        if frame_index != self.next_frame {
            return Err(EngineError::InvariantViolation(format!(
                "raw sink expected frame {}, got {frame_index}",
                self.next_frame
            )));
        }
        write_tight_rows(writer, pixels, row_stride, spec)?.map_err(|e| {
            EngineError::Encode(format!(
                "writing frame {frame_index} to {} failed: {e}",
                self.path.display()
            ))
        })?;
        self.next_frame += 1;
        self.bytes_written += spec.frame_bytes() as u64;

        if self.next_frame % 100 == 0 {
            debug!(
                frames = self.next_frame,
                bytes_mb = self.bytes_written / (1024 * 1024),
                "Sink progress"
            );
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| {
                EngineError::Encode(format!("flushing {} failed: {e}", self.path.display()))
            })?;
        }
        info!(
            frames = self.next_frame,
            bytes = self.bytes_written,
            path = %self.path.display(),
            "Raw video sink flushed"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.spec = None;
        match self.writer.take() {
            Some(mut writer) => writer
                .flush()
                .map_err(|e| EngineError::io(format!("close {}", self.path.display()), e)),
            None => Ok(()),
        }
    }
}
