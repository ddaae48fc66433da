use std::ffi::OsStr;
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::debug;
use vsdf_core::error::{EngineError, Result};

/// H.264 encoders in order of preference.
pub const H264_CANDIDATES: [&str; 4] = ["libx264", "h264_videotoolbox", "h264", "libopenh264"];

/// What the local FFmpeg installation offers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FfmpegProbe {
    pub version: String,
    pub h264_encoder: Option<String>,
}

impl FfmpegProbe {
    pub fn run(program: impl AsRef<OsStr>) -> Result<Self> {
        let program = program.as_ref();
        Ok(Self {
            version: ffmpeg_version(program)?,
            h264_encoder: pick_h264_encoder(program)?,
        })
    }
}

fn capture_stdout(program: &OsStr, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| {
            EngineError::EncoderOpen(format!(
                "failed to run {}: {e}",
                program.to_string_lossy()
            ))
        })?;
    if !output.status.success() {
        return Err(EngineError::EncoderOpen(format!(
            "{} {} exited with {}",
            program.to_string_lossy(),
            args.join(" "),
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// First line of `ffmpeg -version`.
pub fn ffmpeg_version(program: impl AsRef<OsStr>) -> Result<String> {
    let text = capture_stdout(program.as_ref(), &["-version"])?;
    text.lines()
        .next()
        .map(|line| line.trim().to_owned())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| EngineError::EncoderOpen("ffmpeg -version printed nothing".into()))
}

/// Names from the table printed by `ffmpeg -encoders`.
///
/// Rows follow the ` ------` separator and read `<flags> <name> <description>`.
pub fn parse_encoder_list(text: &str) -> Vec<String> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_owned)
        .collect()
}

/// First entry of [`H264_CANDIDATES`] present in `available`.
pub fn choose_h264_encoder<S: AsRef<str>>(available: &[S]) -> Option<&'static str> {
    H264_CANDIDATES
        .into_iter()
        .find(|candidate| available.iter().any(|name| name.as_ref() == *candidate))
}

/// Best H.264 encoder offered by `program`, if any.
pub fn pick_h264_encoder(program: impl AsRef<OsStr>) -> Result<Option<String>> {
    let text = capture_stdout(program.as_ref(), &["-hide_banner", "-encoders"])?;
    let available = parse_encoder_list(&text);
    debug!(count = available.len(), "FFmpeg encoders listed");
    Ok(choose_h264_encoder(&available).map(str::to_owned))
}
