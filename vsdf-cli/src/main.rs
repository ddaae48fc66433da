//! vsdf CLI entrypoint.
//!
//! ```bash
//! vsdf render --frames 300 --output orbs.mp4
//! vsdf render --frames 60 --scene quadrants --raw-output out.raw --debug-dump-ppm frames/
//! vsdf render --config render.json --ring-size 3 --json
//! vsdf probe --json
//! vsdf scenes
//! ```
//!
//! Failures exit with the error category (`1` configuration, `2` encoder
//! open, `3` encode, `4` shutdown, `5` render or I/O, `6` format, `7`
//! internal).  The full code is in the `--json` error envelope.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use vsdf_core::error::{EngineError, Result};
use vsdf_core::types::FrameExtent;
use vsdf_ffmpeg::{EncodeSettings, FfmpegEncoder, FfmpegProbe, RawVideoEncoder};
use vsdf_pipeline::{DEFAULT_RING_SIZE, PipelineConfig, RingPipeline, RunReport};
use vsdf_render::{Scene, SoftwareRenderer};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "vsdf",
    version,
    about = "Offline procedural shader renderer with ring-buffered video encoding",
    arg_required_else_help = true,
    after_help = "Examples:\n  vsdf render --frames 300 --output out.mp4\n  vsdf render --frames 60 --raw-output out.raw --ring-size 3 --json\n  vsdf probe --json\n  vsdf scenes"
)]
struct Cli {
    /// Log filter, e.g. `debug` or `vsdf_pipeline=trace`. Overrides RUST_LOG.
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a scene offline and encode it.
    Render(RenderArgs),
    /// Report the FFmpeg version and the H.264 encoder that would be used.
    Probe(ProbeArgs),
    /// List the built-in scenes.
    Scenes(ScenesArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct RenderArgs {
    /// Number of frames to render.
    #[arg(short = 'n', long = "frames")]
    frames: Option<u64>,

    /// Encoded output file, written through FFmpeg.
    #[arg(short = 'o', long = "output", conflicts_with = "raw_output")]
    output: Option<PathBuf>,

    /// Headerless raw-video output file. Needs no FFmpeg.
    #[arg(long = "raw-output")]
    raw_output: Option<PathBuf>,

    /// Frame slots in flight (1 serializes render and encode).
    #[arg(long = "ring-size")]
    ring_size: Option<usize>,

    #[arg(long = "width")]
    width: Option<u32>,

    #[arg(long = "height")]
    height: Option<u32>,

    #[arg(long = "fps")]
    fps: Option<u32>,

    /// Constant rate factor. Negative leaves the codec default.
    #[arg(long = "crf", allow_negative_numbers = true)]
    crf: Option<i32>,

    /// Codec preset. Empty leaves the codec default.
    #[arg(long = "preset")]
    preset: Option<String>,

    /// FFmpeg video encoder name.
    #[arg(long = "codec")]
    codec: Option<String>,

    /// Scene to render (see `vsdf scenes`).
    #[arg(long = "scene")]
    scene: Option<Scene>,

    /// Also write every frame as `frame_NNNN.ppm` into this directory.
    #[arg(long = "debug-dump-ppm")]
    debug_dump_ppm: Option<PathBuf>,

    /// JSON render configuration. Explicit flags override its values.
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// FFmpeg executable.
    #[arg(long = "ffmpeg")]
    ffmpeg: Option<PathBuf>,

    /// Forward FFmpeg's own log output.
    #[arg(long = "verbose-ffmpeg", default_value_t = false)]
    verbose_ffmpeg: bool,

    /// Emit the run report as JSON to stdout.
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    /// FFmpeg executable.
    #[arg(long = "ffmpeg", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct ScenesArgs {
    #[arg(long = "json", default_value_t = false)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.log_level.as_deref()) {
        eprintln!("{err}");
        std::process::exit(exit_status(&err));
    }

    let json_error_command = match &cli.command {
        Commands::Render(args) if args.json => Some("render"),
        Commands::Probe(args) if args.json => Some("probe"),
        Commands::Scenes(args) if args.json => Some("scenes"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Render(args) => run_render(args),
        Commands::Probe(args) => run_probe(args),
        Commands::Scenes(args) => run_scenes(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(exit_status(&err));
        }
    }
}

fn init_tracing(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(directives) => tracing_subscriber::EnvFilter::try_new(directives).map_err(|e| {
            EngineError::Configuration(format!("invalid --log-level '{directives}': {e}"))
        })?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    };
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
    Ok(())
}

// ─── Render configuration ───────────────────────────────────────────────────

/// Settings for `vsdf render`, loadable from `--config`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RenderConfig {
    frames: u64,
    width: u32,
    height: u32,
    ring_size: usize,
    fps: u32,
    crf: i32,
    preset: String,
    codec: String,
    scene: Scene,
    output: Option<PathBuf>,
    raw_output: Option<PathBuf>,
    debug_dump_dir: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
    verbose_ffmpeg: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let encode = EncodeSettings::default();
        Self {
            frames: 0,
            width: 1280,
            height: 720,
            ring_size: DEFAULT_RING_SIZE,
            fps: encode.fps,
            crf: encode.crf,
            preset: encode.preset,
            codec: encode.codec,
            scene: Scene::default(),
            output: None,
            raw_output: None,
            debug_dump_dir: None,
            ffmpeg: None,
            verbose_ffmpeg: false,
        }
    }
}

/// Where the encoded frames go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sink {
    Ffmpeg(PathBuf),
    Raw(PathBuf),
}

impl RenderConfig {
    /// Paths in a config file are relative to the file's directory.
    fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |path: PathBuf| {
            if path.is_absolute() {
                path
            } else {
                base.join(path)
            }
        };
        self.output = self.output.map(resolve);
        self.raw_output = self.raw_output.map(resolve);
        self.debug_dump_dir = self.debug_dump_dir.map(resolve);
        self
    }

    fn apply_overrides(mut self, args: &RenderArgs) -> Self {
        if let Some(frames) = args.frames {
            self.frames = frames;
        }
        if let Some(width) = args.width {
            self.width = width;
        }
        if let Some(height) = args.height {
            self.height = height;
        }
        if let Some(ring_size) = args.ring_size {
            self.ring_size = ring_size;
        }
        if let Some(fps) = args.fps {
            self.fps = fps;
        }
        if let Some(crf) = args.crf {
            self.crf = crf;
        }
        if let Some(preset) = &args.preset {
            self.preset = preset.clone();
        }
        if let Some(codec) = &args.codec {
            self.codec = codec.clone();
        }
        if let Some(scene) = args.scene {
            self.scene = scene;
        }
        // An output flag replaces whichever output the file chose.
        if args.output.is_some() || args.raw_output.is_some() {
            self.output = args.output.clone();
            self.raw_output = args.raw_output.clone();
        }
        if let Some(dir) = &args.debug_dump_ppm {
            self.debug_dump_dir = Some(dir.clone());
        }
        if let Some(program) = &args.ffmpeg {
            self.ffmpeg = Some(program.clone());
        }
        self.verbose_ffmpeg |= args.verbose_ffmpeg;
        self
    }

    fn sink(&self) -> Result<Sink> {
        match (&self.output, &self.raw_output) {
            (Some(path), None) => Ok(Sink::Ffmpeg(path.clone())),
            (None, Some(path)) => Ok(Sink::Raw(path.clone())),
            (None, None) => Err(EngineError::Configuration(
                "one of --output or --raw-output is required".into(),
            )),
            (Some(_), Some(_)) => Err(EngineError::Configuration(
                "--output and --raw-output are mutually exclusive".into(),
            )),
        }
    }

    fn pipeline_config(&self) -> PipelineConfig {
        let config = PipelineConfig::new(self.frames).with_ring_size(self.ring_size);
        match &self.debug_dump_dir {
            Some(dir) => config.with_debug_dump_dir(dir),
            None => config,
        }
    }

    fn encode_settings(&self, output_path: PathBuf) -> EncodeSettings {
        EncodeSettings {
            output_path,
            codec: self.codec.clone(),
            fps: self.fps,
            crf: self.crf,
            preset: self.preset.clone(),
            verbose: self.verbose_ffmpeg,
        }
    }
}

fn load_render_config(path: &Path) -> Result<RenderConfig> {
    let data = std::fs::read_to_string(path).map_err(|err| {
        EngineError::Configuration(format!(
            "failed to read render config {}: {err}",
            path.display()
        ))
    })?;
    let config = serde_json::from_str::<RenderConfig>(&data).map_err(|err| {
        EngineError::Configuration(format!(
            "invalid render config JSON {}: {err}",
            path.display()
        ))
    })?;
    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(config.resolve_paths(base))
}

fn resolve_render_config(args: &RenderArgs) -> Result<RenderConfig> {
    let base = match &args.config {
        Some(path) => load_render_config(path)?,
        None => RenderConfig::default(),
    };
    Ok(base.apply_overrides(args))
}

// ─── Commands ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RenderSummary<'a> {
    schema_version: u32,
    command: &'static str,
    ok: bool,
    scene: Scene,
    width: u32,
    height: u32,
    output: &'a Path,
    throughput_fps: f64,
    report: &'a RunReport,
}

fn run_render(args: RenderArgs) -> Result<()> {
    let config = resolve_render_config(&args)?;
    let sink = config.sink()?;
    let pipeline_config = config.pipeline_config();
    pipeline_config.validate()?;
    let extent = FrameExtent::new(config.width, config.height).validate()?;

    let renderer = SoftwareRenderer::new(extent, config.scene, config.fps)?;
    let pipeline = RingPipeline::new(renderer, pipeline_config)?;
    let (report, output) = match sink {
        Sink::Ffmpeg(path) => {
            let settings = config.encode_settings(path.clone());
            let encoder = match &config.ffmpeg {
                Some(program) => FfmpegEncoder::with_program(settings, program),
                None => FfmpegEncoder::new(settings),
            };
            (pipeline.run(encoder)?, path)
        }
        Sink::Raw(path) => (pipeline.run(RawVideoEncoder::new(&path))?, path),
    };

    if args.json {
        let summary = RenderSummary {
            schema_version: JSON_SCHEMA_VERSION,
            command: "render",
            ok: true,
            scene: config.scene,
            width: extent.width,
            height: extent.height,
            output: &output,
            throughput_fps: report.throughput_fps(),
            report: &report,
        };
        println!("{}", to_json(&summary)?);
    } else {
        println!("render: ok");
        println!("scene={} extent={extent}", config.scene);
        println!("output={}", output.display());
        println!(
            "frames={} ring_size={} peak_in_flight={}",
            report.frames_encoded, report.ring_size, report.peak_in_flight
        );
        println!(
            "elapsed_ms={} fps={:.1}",
            report.elapsed_ms,
            report.throughput_fps()
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ProbeSummary<'a> {
    schema_version: u32,
    command: &'static str,
    ok: bool,
    #[serde(flatten)]
    probe: &'a FfmpegProbe,
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    let probe = FfmpegProbe::run(&args.ffmpeg)?;
    if args.json {
        let summary = ProbeSummary {
            schema_version: JSON_SCHEMA_VERSION,
            command: "probe",
            ok: true,
            probe: &probe,
        };
        println!("{}", to_json(&summary)?);
    } else {
        println!("probe: ok");
        println!("ffmpeg_version={}", probe.version);
        println!(
            "h264_encoder={}",
            probe.h264_encoder.as_deref().unwrap_or("none")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct SceneEntry {
    name: &'static str,
    description: &'static str,
    default: bool,
}

fn run_scenes(args: ScenesArgs) -> Result<()> {
    let entries: Vec<SceneEntry> = Scene::ALL
        .into_iter()
        .map(|scene| SceneEntry {
            name: scene.name(),
            description: scene.description(),
            default: scene == Scene::default(),
        })
        .collect();

    if args.json {
        let value = serde_json::json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "scenes",
            "ok": true,
            "scenes": entries,
        });
        println!("{value}");
    } else {
        for entry in &entries {
            let marker = if entry.default { " (default)" } else { "" };
            println!("{:<10} {}{marker}", entry.name, entry.description);
        }
    }
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::InvariantViolation(format!("JSON output: {e}")))
}

/// Process exit status for `err`: its error code's hundreds digit.
fn exit_status(err: &EngineError) -> i32 {
    (err.error_code() / 100) as i32
}

fn command_error_json(command: &str, err: &EngineError) -> String {
    serde_json::json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "code": err.error_code(),
        "error": err.to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::{RenderArgs, RenderConfig, Sink, exit_status};
    use std::path::{Path, PathBuf};
    use vsdf_render::Scene;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = RenderConfig::default();
        assert_eq!((config.width, config.height), (1280, 720));
        assert_eq!(config.ring_size, 2);
        assert_eq!(config.fps, 30);
        assert_eq!(config.crf, 20);
        assert_eq!(config.preset, "slow");
        assert_eq!(config.codec, "libx264");
        assert_eq!(config.scene, Scene::Orbs);
    }

    #[test]
    fn explicit_flags_override_the_file() {
        let file: RenderConfig = serde_json::from_str(
            r#"{"frames": 90, "ring_size": 4, "scene": "plasma", "output": "clip.mp4"}"#,
        )
        .expect("parse");
        let args = RenderArgs {
            ring_size: Some(1),
            raw_output: Some(PathBuf::from("clip.raw")),
            ..RenderArgs::default()
        };
        let config = file.apply_overrides(&args);
        assert_eq!(config.frames, 90);
        assert_eq!(config.ring_size, 1);
        assert_eq!(config.scene, Scene::Plasma);
        assert_eq!(
            config.sink().expect("one sink"),
            Sink::Raw(PathBuf::from("clip.raw"))
        );
    }

    #[test]
    fn unknown_config_keys_are_rejected() {
        let parsed = serde_json::from_str::<RenderConfig>(r#"{"ring": 3}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn config_paths_resolve_against_the_file() {
        let config = RenderConfig {
            output: Some(PathBuf::from("out.mp4")),
            debug_dump_dir: Some(PathBuf::from("/abs/frames")),
            ..RenderConfig::default()
        }
        .resolve_paths(Path::new("jobs"));
        assert_eq!(config.output, Some(PathBuf::from("jobs/out.mp4")));
        assert_eq!(config.debug_dump_dir, Some(PathBuf::from("/abs/frames")));
    }

    #[test]
    fn a_sink_is_required() {
        let err = RenderConfig::default().sink().expect_err("no output");
        assert_eq!(err.error_code(), 100);
    }

    #[test]
    fn exit_status_fits_in_a_byte() {
        use vsdf_core::error::EngineError;

        assert_eq!(exit_status(&EngineError::Configuration("x".into())), 1);
        assert_eq!(exit_status(&EngineError::Encode("x".into())), 3);
        assert_eq!(exit_status(&EngineError::Faulted("x".into())), 3);
        assert_eq!(exit_status(&EngineError::Io("x".into())), 5);
        assert_eq!(
            exit_status(&EngineError::PanicRecovered {
                stage: "encode",
                message: "x".into()
            }),
            7
        );
    }
}
