//! [`FrameEncoder`] backed by an `ffmpeg` child process.
//!
//! Raw frames are written to the child's stdin; FFmpeg does colour
//! conversion, compression and muxing.  Unless `verbose` is set, the child's
//! stderr is drained on a helper thread that keeps the last few kilobytes, so
//! a chatty FFmpeg can never block on a full pipe and a failure can still be
//! explained.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};
use vsdf_core::codec_traits::FrameEncoder;
use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::{PixelLayout, StreamSpec};

use crate::settings::EncodeSettings;
use crate::write_tight_rows;

/// Bytes of FFmpeg stderr kept for error messages.
const STDERR_TAIL_BYTES: usize = 4096;

/// FFmpeg `-pix_fmt` name for an input layout.
pub fn ffmpeg_pix_fmt(layout: PixelLayout) -> &'static str {
    match layout {
        PixelLayout::Bgra8 => "bgra",
        PixelLayout::Rgba8 => "rgba",
        PixelLayout::Rgb8 => "rgb24",
    }
}

/// Command-line arguments for encoding `spec` frames read from stdin.
pub fn ffmpeg_args(settings: &EncodeSettings, spec: &StreamSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        if settings.verbose { "info" } else { "error" }.into(),
        "-y".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        ffmpeg_pix_fmt(spec.layout).into(),
        "-s".into(),
        spec.extent.to_string().into(),
        "-r".into(),
        settings.fps.to_string().into(),
        "-i".into(),
        "-".into(),
        "-c:v".into(),
        settings.codec.as_str().into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ];
    if settings.crf >= 0 {
        args.extend(["-crf".into(), settings.crf.to_string().into()]);
    }
    if !settings.preset.is_empty() {
        args.extend(["-preset".into(), settings.preset.as_str().into()]);
    }
    args.extend(["-g".into(), settings.fps.to_string().into()]);
    args.push(settings.output_path.clone().into_os_string());
    args
}

/// Encodes frames by piping them into `ffmpeg`.
pub struct FfmpegEncoder {
    settings: EncodeSettings,
    program: PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr_tail: Option<JoinHandle<String>>,
    spec: Option<StreamSpec>,
    frames: u64,
}

impl FfmpegEncoder {
    pub fn new(settings: EncodeSettings) -> Self {
        Self::with_program(settings, "ffmpeg")
    }

    /// Use a specific FFmpeg executable instead of the one on `PATH`.
    pub fn with_program(settings: EncodeSettings, program: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            program: program.into(),
            child: None,
            stdin: None,
            stderr_tail: None,
            spec: None,
            frames: 0,
        }
    }

    pub fn settings(&self) -> &EncodeSettings {
        &self.settings
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    fn collect_stderr_tail(&mut self) -> String {
        match self.stderr_tail.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => String::new(),
        }
    }
}

fn drain_stderr(mut stderr: impl Read) -> String {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(STDERR_TAIL_BYTES);
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                tail.extend(&chunk[..n]);
                let excess = tail.len().saturating_sub(STDERR_TAIL_BYTES);
                tail.drain(..excess);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(tail.make_contiguous()).trim().to_owned()
}

impl FrameEncoder for FfmpegEncoder {
    fn open(&mut self, spec: &StreamSpec) -> Result<()> {
        if self.child.is_some() {
            return Err(EngineError::EncoderOpen("ffmpeg encoder already open".into()));
        }
        self.settings.validate()?;
        if spec.extent.width % 2 != 0 || spec.extent.height % 2 != 0 {
            return Err(EngineError::EncoderOpen(format!(
                "yuv420p output needs even dimensions, got {}",
                spec.extent
            )));
        }

        let args = ffmpeg_args(&self.settings, spec);
        debug!(program = %self.program.display(), ?args, "Spawning ffmpeg");
        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(if self.settings.verbose {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .spawn()
            .map_err(|e| {
                EngineError::EncoderOpen(format!(
                    "failed to start {}: {e} (is FFmpeg installed and on PATH?)",
                    self.program.display()
                ))
            })?;

        self.stdin = child.stdin.take();
        if self.stdin.is_none() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::EncoderOpen("ffmpeg stdin unavailable".into()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.stderr_tail = std::thread::Builder::new()
                .name("vsdf-ffmpeg-stderr".into())
                .spawn(move || drain_stderr(stderr))
                .ok();
        }
        self.child = Some(child);
        self.spec = Some(*spec);
        self.frames = 0;

        info!(
            output = %self.settings.output_path.display(),
            codec = %self.settings.codec,
            extent = %spec.extent,
            fps = self.settings.fps,
            "FFmpeg encoder opened"
        );
        Ok(())
    }

    fn submit_frame(&mut self, pixels: &[u8], row_stride: usize, frame_index: u64) -> Result<()> {
        let (Some(stdin), Some(spec)) = (self.stdin.as_mut(), self.spec.as_ref()) else {
            return Err(EngineError::Encode("ffmpeg encoder is not open".into()));
        };
        write_tight_rows(stdin, pixels, row_stride, spec)?.map_err(|e| {
            EngineError::Encode(format!(
                "writing frame {frame_index} to ffmpeg failed: {e}"
            ))
        })?;
        self.frames += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Closing stdin is FFmpeg's end-of-input.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = child
            .wait()
            .map_err(|e| EngineError::Encode(format!("waiting for ffmpeg failed: {e}")))?;
        let tail = self.collect_stderr_tail();
        if !status.success() {
            return Err(EngineError::Encode(if tail.is_empty() {
                format!("ffmpeg exited with {status}")
            } else {
                format!("ffmpeg exited with {status}: {tail}")
            }));
        }
        info!(
            frames = self.frames,
            output = %self.settings.output_path.display(),
            "FFmpeg encode finished"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            warn!("Closing ffmpeg before it finished; output is incomplete");
            if let Err(e) = child.kill() {
                debug!(error = %e, "ffmpeg already exited");
            }
            child
                .wait()
                .map_err(|e| EngineError::Shutdown(format!("reaping ffmpeg failed: {e}")))?;
        }
        let tail = self.collect_stderr_tail();
        if !tail.is_empty() {
            debug!(stderr = %tail, "ffmpeg stderr");
        }
        self.spec = None;
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "FFmpeg encoder dropped with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FfmpegEncoder, drain_stderr, ffmpeg_args};
    use crate::settings::EncodeSettings;
    use vsdf_core::codec_traits::FrameEncoder;
    use vsdf_core::types::{FrameExtent, PixelLayout, StreamSpec};

    const SPEC: StreamSpec = StreamSpec {
        extent: FrameExtent::new(64, 36),
        layout: PixelLayout::Bgra8,
    };

    fn args_of(settings: &EncodeSettings) -> Vec<String> {
        ffmpeg_args(settings, &SPEC)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn command_line_describes_the_raw_input() {
        let args = args_of(&EncodeSettings::new("out.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt bgra -s 64x36 -r 30 -i -"));
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p -crf 20 -preset slow -g 30"));
        assert_eq!(args.last().map(String::as_str), Some("out.mp4"));
    }

    #[test]
    fn negative_crf_and_empty_preset_are_omitted() {
        let settings = EncodeSettings {
            crf: -1,
            preset: String::new(),
            ..EncodeSettings::new("out.mkv")
        };
        let args = args_of(&settings);
        assert!(!args.iter().any(|a| a == "-crf"));
        assert!(!args.iter().any(|a| a == "-preset"));
    }

    #[test]
    fn missing_program_is_an_open_error() {
        let mut encoder = FfmpegEncoder::with_program(
            EncodeSettings::new("out.mp4"),
            "/nonexistent/vsdf-test-ffmpeg",
        );
        let err = encoder.open(&SPEC).expect_err("spawn fails");
        assert_eq!(err.error_code(), 200);
        encoder.close().expect("close after failed open");
        encoder.close().expect("close twice");
    }

    #[test]
    fn odd_dimensions_are_rejected_before_spawning() {
        let mut encoder = FfmpegEncoder::new(EncodeSettings::new("out.mp4"));
        let spec = StreamSpec {
            extent: FrameExtent::new(63, 36),
            ..SPEC
        };
        let err = encoder.open(&spec).expect_err("odd width");
        assert!(err.to_string().contains("even"));
    }

    #[test]
    fn submit_before_open_fails() {
        let mut encoder = FfmpegEncoder::new(EncodeSettings::new("out.mp4"));
        let err = encoder.submit_frame(&[0; 16], 4, 0).expect_err("not open");
        assert_eq!(err.error_code(), 300);
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let noise = vec![b'x'; 10_000];
        let mut input = noise;
        input.extend_from_slice(b"final error line");
        let tail = drain_stderr(input.as_slice());
        assert!(tail.len() <= super::STDERR_TAIL_BYTES);
        assert!(tail.ends_with("final error line"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_child_reports_its_exit_status() {
        let mut encoder = FfmpegEncoder::with_program(EncodeSettings::new("out.mp4"), "false");
        encoder.open(&SPEC).expect("spawn");
        let err = encoder.flush().expect_err("non-zero exit");
        assert!(err.to_string().contains("ffmpeg exited with"));
        encoder.close().expect("close");
    }

    #[cfg(unix)]
    #[test]
    fn successful_child_flushes_cleanly() {
        let mut encoder = FfmpegEncoder::with_program(EncodeSettings::new("out.mp4"), "true");
        encoder.open(&SPEC).expect("spawn");
        encoder.flush().expect("zero exit");
        encoder.close().expect("close");
    }
}
