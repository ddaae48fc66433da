#![doc = include_str!("../README.md")]

/// FFmpeg child-process encoder fed through stdin.
pub mod ffmpeg_encoder;
/// FFmpeg discovery: version string and H.264 encoder selection.
pub mod probe;
/// Headerless raw-video file sink.
pub mod raw_sink;
pub mod settings;

pub use ffmpeg_encoder::FfmpegEncoder;
pub use probe::{FfmpegProbe, H264_CANDIDATES, ffmpeg_version, pick_h264_encoder};
pub use raw_sink::RawVideoEncoder;
pub use settings::EncodeSettings;

use std::io::Write;

use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::StreamSpec;

/// Write one frame of `spec` as tightly packed rows.
///
/// `row_stride` may exceed the tight row size; the padding is skipped.
pub(crate) fn write_tight_rows<W: Write>(
    out: &mut W,
    pixels: &[u8],
    row_stride: usize,
    spec: &StreamSpec,
) -> Result<std::io::Result<()>> {
    let row_bytes = spec.row_stride();
    let height = spec.extent.height as usize;
    if row_stride < row_bytes {
        return Err(EngineError::InvariantViolation(format!(
            "row stride {row_stride} shorter than row size {row_bytes}"
        )));
    }
    let need = if height == 0 {
        0
    } else {
        row_stride * (height - 1) + row_bytes
    };
    if pixels.len() < need {
        return Err(EngineError::BufferTooSmall {
            need,
            have: pixels.len(),
        });
    }

    if row_stride == row_bytes {
        return Ok(out.write_all(&pixels[..need]));
    }
    for row in pixels.chunks(row_stride).take(height) {
        if let Err(e) = out.write_all(&row[..row_bytes]) {
            return Ok(Err(e));
        }
    }
    Ok(Ok(()))
}
