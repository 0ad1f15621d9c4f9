// src/compose/ffmpeg.rs
//! FFmpeg/FFprobe process helpers.
//!
//! Invocations go through the `CommandRunner` seam: production shells out,
//! tests script the outcomes. The blocking `Command` call always runs under
//! `spawn_blocking` so transcoding never stalls the event loop.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

// Canonical clip shape every segment converges on before concatenation.
pub const CANONICAL_WIDTH: u32 = 1920;
pub const CANONICAL_HEIGHT: u32 = 1080;
pub const CANONICAL_FPS: u32 = 30;
const CANONICAL_CRF: &str = "23";
const CANONICAL_PRESET: &str = "medium";

/// Relative volume for background music under narration.
pub const MUSIC_VOLUME: f64 = 0.2;

pub trait CommandRunner: Send + Sync {
    /// Run a tool to completion, returning stdout on success.
    fn run(&self, program: &str, args: &[String]) -> Result<String, String>;
}

/// Shells out to the real binaries.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, String> {
        tracing::debug!("Executing {}: {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| format!("Failed to execute {}: {}", program, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("{} error: {}", program, stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Check that ffmpeg and ffprobe are on PATH.
pub fn check_ffmpeg_available() -> Result<(), String> {
    Command::new("ffmpeg")
        .args(["-version"])
        .output()
        .map_err(|_| "FFmpeg not found. Please install FFmpeg.")?;

    Command::new("ffprobe")
        .args(["-version"])
        .output()
        .map_err(|_| "FFprobe not found. Please install FFmpeg with FFprobe.")?;

    Ok(())
}

/// Run a tool on the blocking pool.
pub async fn run_tool(
    runner: Arc<dyn CommandRunner>,
    program: &'static str,
    args: Vec<String>,
) -> Result<String, String> {
    tokio::task::spawn_blocking(move || runner.run(program, &args))
        .await
        .map_err(|e| format!("{} task failed: {}", program, e))?
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn canonical_video_filter() -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,\
         pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps={fps}",
        w = CANONICAL_WIDTH,
        h = CANONICAL_HEIGHT,
        fps = CANONICAL_FPS
    )
}

fn canonical_encode_args() -> Vec<String> {
    vec![
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        CANONICAL_PRESET.to_string(),
        "-crf".to_string(),
        CANONICAL_CRF.to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ]
}

/// Re-encode a provided video to the canonical resolution/framerate with its
/// audio stripped.
pub fn normalize_video_args(input: &Path, output: &Path) -> Vec<String> {
    let mut args = vec![
        "-i".to_string(),
        path_str(input),
        "-vf".to_string(),
        canonical_video_filter(),
        "-an".to_string(),
    ];
    args.extend(canonical_encode_args());
    args.push("-y".to_string());
    args.push(path_str(output));
    args
}

/// Turn a still image into a canonical clip of exactly `duration` seconds.
pub fn still_to_clip_args(image: &Path, output: &Path, duration: f64) -> Vec<String> {
    let mut args = vec![
        "-loop".to_string(),
        "1".to_string(),
        "-i".to_string(),
        path_str(image),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-vf".to_string(),
        canonical_video_filter(),
    ];
    args.extend(canonical_encode_args());
    args.push("-y".to_string());
    args.push(path_str(output));
    args
}

/// Join canonical clips via the concat demuxer with a lossless stream copy.
pub fn concat_video_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        path_str(list_file),
        "-c".to_string(),
        "copy".to_string(),
        "-y".to_string(),
        path_str(output),
    ]
}

/// Concatenate narration tracks into one AAC stream.
pub fn concat_audio_args(list_file: &Path, output: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "concat".to_string(),
        "-safe".to_string(),
        "0".to_string(),
        "-i".to_string(),
        path_str(list_file),
        "-c:a".to_string(),
        "aac".to_string(),
        "-y".to_string(),
        path_str(output),
    ]
}

/// Attach narration as the sole audio stream, trimmed to the shorter of
/// video/audio.
pub fn mux_narration_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_str(video),
        "-i".to_string(),
        path_str(audio),
        "-map".to_string(),
        "0:v:0".to_string(),
        "-map".to_string(),
        "1:a:0".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-shortest".to_string(),
        "-y".to_string(),
        path_str(output),
    ]
}

/// Loop background music under the narration at a fixed low volume.
pub fn music_mix_args(narrated: &Path, music: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_str(narrated),
        "-stream_loop".to_string(),
        "-1".to_string(),
        "-i".to_string(),
        path_str(music),
        "-filter_complex".to_string(),
        format!(
            "[1:a]volume={vol}[music];[0:a][music]amix=inputs=2:duration=first:dropout_transition=2[mixed]",
            vol = MUSIC_VOLUME
        ),
        "-map".to_string(),
        "0:v".to_string(),
        "-map".to_string(),
        "[mixed]".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-shortest".to_string(),
        "-y".to_string(),
        path_str(output),
    ]
}

/// Full ffprobe metadata dump as JSON.
pub fn probe_args(input: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        path_str(input),
    ]
}

/// Extract every `interval`-th frame as PNGs under `pattern`.
pub fn sample_frames_args(input: &Path, pattern: &Path, interval: u64) -> Vec<String> {
    vec![
        "-i".to_string(),
        path_str(input),
        "-vf".to_string(),
        format!("select='not(mod(n\\,{}))'", interval.max(1)),
        "-vsync".to_string(),
        "vfr".to_string(),
        "-y".to_string(),
        path_str(pattern),
    ]
}

/// Grab a single frame at `timestamp` seconds.
pub fn frame_at_args(input: &Path, timestamp: f64, output: &Path) -> Vec<String> {
    vec![
        "-ss".to_string(),
        format!("{:.3}", timestamp.max(0.0)),
        "-i".to_string(),
        path_str(input),
        "-frames:v".to_string(),
        "1".to_string(),
        "-y".to_string(),
        path_str(output),
    ]
}

/// Read the container duration in seconds from probe JSON.
pub fn duration_from_probe(probe_json: &str) -> Result<f64, String> {
    let value: serde_json::Value =
        serde_json::from_str(probe_json).map_err(|e| format!("invalid probe output: {}", e))?;
    value["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| value["format"]["duration"].as_f64())
        .ok_or_else(|| "probe output missing duration".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_normalize_strips_audio_and_targets_canonical_shape() {
        let args = normalize_video_args(&PathBuf::from("in.mp4"), &PathBuf::from("out.mp4"));
        assert!(args.contains(&"-an".to_string()));
        let filter = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(filter.contains("1920:1080"));
        assert!(filter.contains("fps=30"));
        assert_eq!(args.last().unwrap(), "out.mp4");
    }

    #[test]
    fn test_still_clip_holds_frame_for_exact_duration() {
        let args = still_to_clip_args(&PathBuf::from("hook.png"), &PathBuf::from("hook.mp4"), 10.0);
        assert!(args.windows(2).any(|w| w[0] == "-loop" && w[1] == "1"));
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "10.000"));
    }

    #[test]
    fn test_concat_uses_lossless_stream_copy() {
        let args = concat_video_args(&PathBuf::from("list.txt"), &PathBuf::from("timeline.mp4"));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
    }

    #[test]
    fn test_narration_mux_applies_shortest_policy() {
        let args = mux_narration_args(
            &PathBuf::from("timeline.mp4"),
            &PathBuf::from("narration.m4a"),
            &PathBuf::from("narrated.mp4"),
        );
        assert!(args.contains(&"-shortest".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "1:a:0"));
    }

    #[test]
    fn test_music_mix_loops_and_attenuates() {
        let args = music_mix_args(
            &PathBuf::from("narrated.mp4"),
            &PathBuf::from("music.mp3"),
            &PathBuf::from("final.mp4"),
        );
        assert!(args.windows(2).any(|w| w[0] == "-stream_loop" && w[1] == "-1"));
        let filter = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
        assert!(filter.contains("volume=0.2"));
        assert!(filter.contains("amix=inputs=2:duration=first"));
    }

    #[test]
    fn test_duration_parses_from_probe_json() {
        let json = r#"{"format":{"duration":"40.12","format_name":"mp4"}}"#;
        assert!((duration_from_probe(json).unwrap() - 40.12).abs() < 1e-9);
        assert!(duration_from_probe("{}").is_err());
        assert!(duration_from_probe("not json").is_err());
    }
}
