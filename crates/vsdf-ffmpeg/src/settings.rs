//! Encoder options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vsdf_core::error::{EngineError, Result};

/// Output path and codec options for [`FfmpegEncoder`](crate::FfmpegEncoder).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeSettings {
    pub output_path: PathBuf,
    pub codec: String,
    pub fps: u32,
    /// Constant rate factor. Negative values leave the codec default.
    pub crf: i32,
    /// Codec preset. Empty leaves the codec default.
    pub preset: String,
    /// Forward FFmpeg's own log output to stderr.
    pub verbose: bool,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            output_path: PathBuf::new(),
            codec: "libx264".into(),
            fps: 30,
            crf: 20,
            preset: "slow".into(),
            verbose: false,
        }
    }
}

impl EncodeSettings {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            ..Self::default()
        }
    }

    /// Checked when the encoder opens.
    pub fn validate(&self) -> Result<()> {
        if self.output_path.as_os_str().is_empty() {
            return Err(EngineError::EncoderOpen("output path is empty".into()));
        }
        if self.fps == 0 {
            return Err(EngineError::EncoderOpen("fps must be positive".into()));
        }
        if self.codec.trim().is_empty() {
            return Err(EngineError::EncoderOpen("codec name is empty".into()));
        }
        Ok(())
    }
}
