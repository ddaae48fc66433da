//! Frame geometry and pixel layout contracts.
//!
//! Every layout documents its memory layout and byte-size formula so that
//! readback and encoder buffers are sized deterministically.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

// ─── Pixel layout ────────────────────────────────────────────────────────────

/// Interleaved 8-bit pixel layouts exchanged between renderer, pipeline and encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelLayout {
    /// `[B G R A]` per pixel. Native swapchain/offscreen layout on most GPUs.
    Bgra8,
    /// `[R G B A]` per pixel.
    Rgba8,
    /// `[R G B]` per pixel, no alpha.
    Rgb8,
}

impl PixelLayout {
    /// Bytes occupied by one pixel.
    #[inline]
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra8 | Self::Rgba8 => 4,
            Self::Rgb8 => 3,
        }
    }

    /// `true` when the blue channel is stored first.
    #[inline]
    pub const fn is_blue_first(self) -> bool {
        matches!(self, Self::Bgra8)
    }

    /// `true` when the layout carries an alpha channel.
    #[inline]
    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::Bgra8 | Self::Rgba8)
    }

    /// Tight row size in bytes for `width` pixels.
    #[inline]
    pub const fn row_bytes(self, width: u32) -> usize {
        width as usize * self.bytes_per_pixel()
    }
}

// ─── Frame extent ────────────────────────────────────────────────────────────

/// Output image size in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameExtent {
    pub width: u32,
    pub height: u32,
}

impl FrameExtent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Reject degenerate extents. Encoders fed through 4:2:0 subsampling
    /// also require even dimensions, which is enforced by the encoder itself.
    pub fn validate(self) -> Result<Self> {
        if self.width == 0 || self.height == 0 {
            return Err(EngineError::Configuration(format!(
                "frame extent must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(self)
    }

    #[inline]
    pub const fn pixel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl std::fmt::Display for FrameExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// ─── Stream description ──────────────────────────────────────────────────────

/// Description of the raw frames an encoder will receive, negotiated once at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub extent: FrameExtent,
    /// Layout of the buffers passed to `submit_frame`.
    pub layout: PixelLayout,
}

impl StreamSpec {
    /// Tight row stride of the normalized frames.
    #[inline]
    pub const fn row_stride(&self) -> usize {
        self.layout.row_bytes(self.extent.width)
    }

    /// Total bytes of one normalized frame.
    #[inline]
    pub const fn frame_bytes(&self) -> usize {
        self.row_stride() * self.extent.height as usize
    }
}
