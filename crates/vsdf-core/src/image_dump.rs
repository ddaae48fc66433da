//! Binary PPM (P6) dumps of rendered frames.
//!
//! Layout is RGB, row-major, `stride` bytes per row with only the first
//! `width × 3` bytes of each row written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::trace;

use crate::error::{EngineError, Result};

/// Maximum sample value written to and accepted from PPM headers.
pub const PPM_MAX_VALUE: u32 = 255;

/// CPU-side RGB frame produced by a debug readback.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpmFrame {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub rgb: Vec<u8>,
}

impl PpmFrame {
    /// Allocate a zeroed frame with a tight stride.
    pub fn allocate(width: u32, height: u32) -> Result<Self> {
        let (stride, len) = tight_layout(width, height)?;
        Ok(Self {
            width,
            height,
            stride,
            rgb: vec![0; len],
        })
    }

    /// RGB triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = y as usize * self.stride + x as usize * 3;
        [self.rgb[offset], self.rgb[offset + 1], self.rgb[offset + 2]]
    }
}

/// Tight row stride and total raster size for `width × height` RGB.
fn tight_layout(width: u32, height: u32) -> Result<(usize, usize)> {
    let stride = (width as usize).checked_mul(3);
    stride
        .and_then(|stride| Some((stride, stride.checked_mul(height as usize)?)))
        .ok_or_else(|| EngineError::Io(format!("PPM dimensions {width}x{height} overflow")))
}

/// Write `frame` to `path` as a binary P6 image.
pub fn write_ppm(frame: &PpmFrame, path: &Path) -> Result<()> {
    if frame.width == 0 || frame.height == 0 || frame.stride == 0 {
        return Err(EngineError::InvariantViolation(
            "invalid frame dimensions for PPM dump".into(),
        ));
    }
    let row_bytes = frame.width as usize * 3;
    let need = frame
        .stride
        .checked_mul(frame.height as usize - 1)
        .and_then(|rows| rows.checked_add(row_bytes))
        .ok_or_else(|| {
            EngineError::InvariantViolation("PPM frame dimensions overflow".into())
        })?;
    if frame.rgb.len() < need {
        return Err(EngineError::BufferTooSmall {
            need,
            have: frame.rgb.len(),
        });
    }

    let file = File::create(path)
        .map_err(|e| EngineError::io(format!("create {}", path.display()), e))?;
    let mut out = BufWriter::new(file);
    let emit = |out: &mut BufWriter<File>| -> std::io::Result<()> {
        write!(out, "P6\n{} {}\n{}\n", frame.width, frame.height, PPM_MAX_VALUE)?;
        for row in frame.rgb.chunks(frame.stride).take(frame.height as usize) {
            out.write_all(&row[..row_bytes])?;
        }
        out.flush()
    };
    emit(&mut out).map_err(|e| EngineError::io(format!("write {}", path.display()), e))?;
    trace!(path = %path.display(), width = frame.width, height = frame.height, "PPM written");
    Ok(())
}

/// Read a binary P6 image. Header comments (`# ...`) are skipped.
pub fn read_ppm(path: &Path) -> Result<PpmFrame> {
    let file =
        File::open(path).map_err(|e| EngineError::io(format!("open {}", path.display()), e))?;
    let mut bytes = Vec::new();
    BufReader::new(file)
        .read_to_end(&mut bytes)
        .map_err(|e| EngineError::io(format!("read {}", path.display()), e))?;

    let mut cursor = 0usize;
    let magic = next_token(&bytes, &mut cursor)?;
    if magic != "P6" {
        return Err(EngineError::Io(format!(
            "{} is not a binary PPM (magic '{magic}')",
            path.display()
        )));
    }
    let width = parse_header_number(&bytes, &mut cursor, "width")?;
    let height = parse_header_number(&bytes, &mut cursor, "height")?;
    let max_value = parse_header_number(&bytes, &mut cursor, "maxval")?;
    if max_value != PPM_MAX_VALUE {
        return Err(EngineError::Io(format!(
            "unsupported PPM maxval {max_value}, expected {PPM_MAX_VALUE}"
        )));
    }
    // Exactly one whitespace byte separates the header from the raster.
    cursor += 1;

    // Size the raster against the file before allocating anything.
    let (stride, need) = tight_layout(width, height)?;
    let have = bytes.len().saturating_sub(cursor);
    let raster = cursor
        .checked_add(need)
        .and_then(|end| bytes.get(cursor..end))
        .ok_or(EngineError::BufferTooSmall { need, have })?;
    Ok(PpmFrame {
        width,
        height,
        stride,
        rgb: raster.to_vec(),
    })
}

fn skip_whitespace_and_comments(bytes: &[u8], cursor: &mut usize) {
    while let Some(&c) = bytes.get(*cursor) {
        if c == b'#' {
            while let Some(&c) = bytes.get(*cursor) {
                *cursor += 1;
                if c == b'\n' {
                    break;
                }
            }
        } else if c.is_ascii_whitespace() {
            *cursor += 1;
        } else {
            break;
        }
    }
}

fn next_token(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    skip_whitespace_and_comments(bytes, cursor);
    let start = *cursor;
    while bytes.get(*cursor).is_some_and(|c| !c.is_ascii_whitespace()) {
        *cursor += 1;
    }
    if start == *cursor {
        return Err(EngineError::Io("truncated PPM header".into()));
    }
    Ok(String::from_utf8_lossy(&bytes[start..*cursor]).into_owned())
}

fn parse_header_number(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u32> {
    let token = next_token(bytes, cursor)?;
    token
        .parse()
        .map_err(|_| EngineError::Io(format!("invalid PPM {field} '{token}'")))
}
