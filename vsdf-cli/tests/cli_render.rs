use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use vsdf_core::image_dump::read_ppm;

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("vsdf_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn vsdf(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vsdf"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run vsdf")
}

fn path_arg(path: &Path) -> &str {
    path.to_str().expect("utf-8 temp path")
}

fn parse_stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn help_lists_subcommands() {
    let output = vsdf(&["help"]);
    assert!(
        output.status.success(),
        "vsdf help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["render", "probe", "scenes"] {
        assert!(stdout.contains(command), "missing {command} in help output");
    }
}

#[test]
fn scenes_lists_every_builtin() {
    let output = vsdf(&["scenes", "--json"]);
    assert!(output.status.success());
    let value = parse_stdout_json(&output);
    let names: Vec<&str> = value["scenes"]
        .as_array()
        .expect("scenes array")
        .iter()
        .filter_map(|scene| scene["name"].as_str())
        .collect();
    assert_eq!(names, vec!["quadrants", "orbs", "plasma"]);
}

#[test]
fn raw_render_writes_every_frame_and_reports_json() {
    let dir = unique_temp_dir("raw");
    let raw = dir.join("out.raw");
    let output = vsdf(&[
        "render",
        "--frames",
        "5",
        "--width",
        "32",
        "--height",
        "16",
        "--ring-size",
        "3",
        "--scene",
        "plasma",
        "--raw-output",
        path_arg(&raw),
        "--json",
    ]);
    assert!(
        output.status.success(),
        "render failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = parse_stdout_json(&output);
    assert_eq!(value["schema_version"].as_u64(), Some(1));
    assert_eq!(value["ok"].as_bool(), Some(true));
    assert_eq!(value["report"]["frames_encoded"].as_u64(), Some(5));
    assert_eq!(value["report"]["frames_discarded"].as_u64(), Some(0));
    assert_eq!(value["report"]["ring_size"].as_u64(), Some(3));
    assert!(value["report"]["peak_in_flight"].as_u64().expect("peak") <= 3);

    // BGRA, tight rows.
    let bytes = fs::metadata(&raw).expect("raw output").len();
    assert_eq!(bytes, 5 * 32 * 16 * 4);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn debug_dump_writes_quadrant_ppms() {
    let dir = unique_temp_dir("ppm");
    let frames = dir.join("frames");
    let raw = dir.join("out.raw");
    let output = vsdf(&[
        "render",
        "--frames",
        "3",
        "--width",
        "16",
        "--height",
        "8",
        "--scene",
        "quadrants",
        "--raw-output",
        path_arg(&raw),
        "--debug-dump-ppm",
        path_arg(&frames),
    ]);
    assert!(
        output.status.success(),
        "render failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    for index in 0..3 {
        assert!(frames.join(format!("frame_{index:04}.ppm")).is_file());
    }
    let frame = read_ppm(&frames.join("frame_0000.ppm")).expect("parse ppm");
    assert_eq!((frame.width, frame.height), (16, 8));
    assert_eq!(frame.pixel(1, 1), [255, 0, 0], "top-left is red");
    assert_eq!(frame.pixel(14, 1), [0, 255, 0], "top-right is green");
    assert_eq!(frame.pixel(1, 6), [0, 0, 0], "bottom-left is black");
    assert_eq!(frame.pixel(14, 6), [0, 0, 255], "bottom-right is blue");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn config_file_supplies_defaults_for_flags() {
    let dir = unique_temp_dir("config");
    let config = dir.join("render.json");
    fs::write(
        &config,
        r#"{"frames": 4, "width": 8, "height": 8, "ring_size": 1, "raw_output": "from_config.raw"}"#,
    )
    .expect("write config");

    let output = vsdf(&["render", "--config", path_arg(&config), "--frames", "2", "--json"]);
    assert!(
        output.status.success(),
        "render failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = parse_stdout_json(&output);
    assert_eq!(value["report"]["frames_encoded"].as_u64(), Some(2));
    assert_eq!(value["report"]["ring_size"].as_u64(), Some(1));
    let raw = dir.join("from_config.raw");
    assert_eq!(fs::metadata(&raw).expect("raw output").len(), 2 * 8 * 8 * 4);
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn zero_ring_size_exits_with_configuration_code() {
    let dir = unique_temp_dir("ring0");
    let raw = dir.join("never.raw");
    let output = vsdf(&[
        "render",
        "--frames",
        "2",
        "--ring-size",
        "0",
        "--raw-output",
        path_arg(&raw),
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let value = parse_stdout_json(&output);
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(value["code"].as_u64(), Some(100));
    assert!(!raw.exists(), "no output before configuration is valid");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn missing_output_is_a_configuration_error() {
    let output = vsdf(&["render", "--frames", "2"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn missing_ffmpeg_fails_to_open_the_encoder() {
    let dir = unique_temp_dir("noffmpeg");
    let out = dir.join("out.mp4");
    let output = vsdf(&[
        "render",
        "--frames",
        "2",
        "--width",
        "16",
        "--height",
        "16",
        "--output",
        path_arg(&out),
        "--ffmpeg",
        "/nonexistent/vsdf-test-ffmpeg",
    ]);
    assert_eq!(output.status.code(), Some(2));
    fs::remove_dir_all(&dir).ok();
}

#[cfg(unix)]
#[test]
fn encoder_failure_mid_run_exits_with_the_encode_category() {
    let dir = unique_temp_dir("encodefail");
    let out = dir.join("out.mp4");
    // `false` starts fine, then exits non-zero without reading a frame.
    let output = vsdf(&[
        "render",
        "--frames",
        "3",
        "--width",
        "16",
        "--height",
        "16",
        "--output",
        path_arg(&out),
        "--ffmpeg",
        "false",
        "--json",
    ]);
    assert_eq!(output.status.code(), Some(3));
    let value = parse_stdout_json(&output);
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(value["code"].as_u64(), Some(300));
    fs::remove_dir_all(&dir).ok();
}
