//! CPU-side normalization of mapped readback buffers.
//!
//! GPU copies are row-aligned, so a mapped buffer usually carries padding at
//! the end of each row, and the native offscreen layout is BGRA.  Everything
//! here is a pure transform into caller-owned memory: no I/O, no allocation
//! once the scratch buffer has reached its steady-state size.

use vsdf_core::error::{EngineError, Result};
use vsdf_core::image_dump::PpmFrame;
use vsdf_core::types::{FrameExtent, PixelLayout};

/// Byte layout of a mapped buffer: pixel size and whether red and blue are
/// stored in swapped (blue-first) order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadbackFormat {
    pub bytes_per_pixel: usize,
    pub swap_rb: bool,
}

impl ReadbackFormat {
    pub const fn from_layout(layout: PixelLayout) -> Self {
        Self {
            bytes_per_pixel: layout.bytes_per_pixel(),
            swap_rb: layout.is_blue_first(),
        }
    }

    #[inline]
    const fn has_alpha(self) -> bool {
        self.bytes_per_pixel == 4
    }
}

/// Minimum mapped size for `height` rows of `row_bytes` at `stride`.
fn required_len(stride: usize, row_bytes: usize, height: usize) -> usize {
    if height == 0 {
        0
    } else {
        stride * (height - 1) + row_bytes
    }
}

/// Copy a mapped frame into `dst`, converting `src_layout` to `dst_layout`.
///
/// Row padding is removed, red and blue are swapped when the two layouts
/// disagree on channel order, and alpha is dropped or filled with 255.
/// `dst` is resized to `width × dst_bpp × height`.
pub fn normalize_frame(
    src: &[u8],
    src_stride: usize,
    src_layout: PixelLayout,
    extent: FrameExtent,
    dst_layout: PixelLayout,
    dst: &mut Vec<u8>,
) -> Result<()> {
    let from = ReadbackFormat::from_layout(src_layout);
    let to = ReadbackFormat::from_layout(dst_layout);
    if !matches!(from.bytes_per_pixel, 3 | 4) || !matches!(to.bytes_per_pixel, 3 | 4) {
        return Err(EngineError::FormatMismatch {
            expected: dst_layout,
            actual: src_layout,
        });
    }

    let width = extent.width as usize;
    let height = extent.height as usize;
    let src_row = width * from.bytes_per_pixel;
    let dst_row = width * to.bytes_per_pixel;
    if src_stride < src_row {
        return Err(EngineError::InvariantViolation(format!(
            "row stride {src_stride} is shorter than a {width}-pixel row ({src_row} bytes)"
        )));
    }
    let need = required_len(src_stride, src_row, height);
    if src.len() < need {
        return Err(EngineError::BufferTooSmall {
            need,
            have: src.len(),
        });
    }

    dst.resize(dst_row * height, 0);
    if height == 0 || width == 0 {
        return Ok(());
    }

    let swap = from.swap_rb != to.swap_rb;
    for (src_line, dst_line) in src
        .chunks(src_stride)
        .zip(dst.chunks_exact_mut(dst_row))
        .take(height)
    {
        let src_line = &src_line[..src_row];
        if src_layout == dst_layout {
            dst_line.copy_from_slice(src_line);
            continue;
        }
        for (s, d) in src_line
            .chunks_exact(from.bytes_per_pixel)
            .zip(dst_line.chunks_exact_mut(to.bytes_per_pixel))
        {
            if swap {
                d[0] = s[2];
                d[2] = s[0];
            } else {
                d[0] = s[0];
                d[2] = s[2];
            }
            d[1] = s[1];
            if to.has_alpha() {
                d[3] = if from.has_alpha() { s[3] } else { u8::MAX };
            }
        }
    }
    Ok(())
}

/// Build the RGB frame used by the debug PPM dump.
pub fn to_rgb_frame(
    src: &[u8],
    src_stride: usize,
    src_layout: PixelLayout,
    extent: FrameExtent,
) -> Result<PpmFrame> {
    let mut frame = PpmFrame::allocate(extent.width, extent.height)?;
    normalize_frame(
        src,
        src_stride,
        src_layout,
        extent,
        PixelLayout::Rgb8,
        &mut frame.rgb,
    )?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::{ReadbackFormat, normalize_frame, to_rgb_frame};
    use vsdf_core::error::EngineError;
    use vsdf_core::types::{FrameExtent, PixelLayout};

    /// 2×2 BGRA frame with 4 bytes of padding per row.
    fn padded_bgra() -> Vec<u8> {
        vec![
            1, 2, 3, 4, 5, 6, 7, 8, 0xEE, 0xEE, 0xEE, 0xEE, //
            9, 10, 11, 12, 13, 14, 15, 16, 0xEE, 0xEE, 0xEE, 0xEE,
        ]
    }

    #[test]
    fn formats_follow_layouts() {
        assert_eq!(
            ReadbackFormat::from_layout(PixelLayout::Bgra8),
            ReadbackFormat {
                bytes_per_pixel: 4,
                swap_rb: true
            }
        );
        assert!(!ReadbackFormat::from_layout(PixelLayout::Rgb8).swap_rb);
    }

    #[test]
    fn same_layout_only_strips_padding() {
        let mut out = Vec::new();
        normalize_frame(
            &padded_bgra(),
            12,
            PixelLayout::Bgra8,
            FrameExtent::new(2, 2),
            PixelLayout::Bgra8,
            &mut out,
        )
        .expect("normalize");
        assert_eq!(out, (1..=16).collect::<Vec<u8>>());
    }

    #[test]
    fn bgra_to_rgba_swaps_red_and_blue() {
        let mut out = Vec::new();
        normalize_frame(
            &padded_bgra(),
            12,
            PixelLayout::Bgra8,
            FrameExtent::new(2, 2),
            PixelLayout::Rgba8,
            &mut out,
        )
        .expect("normalize");
        assert_eq!(&out[..8], &[3, 2, 1, 4, 7, 6, 5, 8]);
    }

    #[test]
    fn rgb_to_bgra_fills_alpha() {
        let mut out = Vec::new();
        normalize_frame(
            &[10, 20, 30],
            3,
            PixelLayout::Rgb8,
            FrameExtent::new(1, 1),
            PixelLayout::Bgra8,
            &mut out,
        )
        .expect("normalize");
        assert_eq!(out, vec![30, 20, 10, 255]);
    }

    #[test]
    fn rgb_frame_for_dump_drops_alpha() {
        let frame = to_rgb_frame(
            &padded_bgra(),
            12,
            PixelLayout::Bgra8,
            FrameExtent::new(2, 2),
        )
        .expect("rgb");
        assert_eq!(frame.pixel(1, 1), [15, 14, 13]);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let mut out = Vec::new();
        let err = normalize_frame(
            &padded_bgra()[..19],
            12,
            PixelLayout::Bgra8,
            FrameExtent::new(2, 2),
            PixelLayout::Rgba8,
            &mut out,
        )
        .expect_err("short");
        assert!(matches!(err, EngineError::BufferTooSmall { need: 20, have: 19 }));
    }
}
