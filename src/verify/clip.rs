// src/verify/clip.rs
//! Video clip verification: container metadata, frame integrity, and a
//! coarse visual-consistency pass over sampled frames.
//!
//! A verification outcome is a report, never an exception: an unreadable or
//! unprobeable file comes back as a failed report.

use std::path::Path;
use std::sync::Arc;

use crate::compose::ffmpeg::{self, CommandRunner};

use super::{Check, CheckStatus, Severity, VerificationReport};
use super::image::channel_stats;

#[derive(Debug, Clone)]
pub struct ClipVerifyConfig {
    pub min_width: u32,
    pub min_height: u32,
    /// Allowed deviation from the expected duration, seconds.
    pub duration_tolerance: f64,
    /// Fewer frames than this raises a warning.
    pub low_frame_warning: u64,
    /// Audio/video lengths further apart than this warn.
    pub av_sync_tolerance: f64,
    /// Decode every Nth frame during the integrity pass.
    pub frame_sample_interval: u64,
    /// Per-channel std below which a sampled frame counts as uniform.
    pub uniform_std_threshold: f64,
}

impl Default for ClipVerifyConfig {
    fn default() -> Self {
        Self {
            min_width: 640,
            min_height: 360,
            duration_tolerance: 1.0,
            low_frame_warning: 24,
            av_sync_tolerance: 0.5,
            frame_sample_interval: 30,
            uniform_std_threshold: 6.0,
        }
    }
}

/// Parsed container metadata, decoupled from ffprobe so the checks stay pure.
#[derive(Debug, Clone, Default)]
pub struct ClipProbe {
    pub file_bytes: u64,
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub has_audio: bool,
    pub audio_duration: Option<f64>,
}

/// Pull the fields we gate on out of `ffprobe -print_format json` output.
pub fn parse_probe(probe_json: &str, file_bytes: u64) -> Result<ClipProbe, String> {
    let value: serde_json::Value =
        serde_json::from_str(probe_json).map_err(|e| format!("invalid probe output: {}", e))?;

    let duration = value["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| value["format"]["duration"].as_f64())
        .unwrap_or(0.0);

    let mut probe = ClipProbe {
        file_bytes,
        duration,
        ..ClipProbe::default()
    };

    let streams = value["streams"].as_array().cloned().unwrap_or_default();
    for stream in &streams {
        match stream["codec_type"].as_str() {
            Some("video") => {
                probe.width = stream["width"].as_u64().unwrap_or(0) as u32;
                probe.height = stream["height"].as_u64().unwrap_or(0) as u32;
                probe.frame_count = stream["nb_frames"]
                    .as_str()
                    .and_then(|n| n.parse::<u64>().ok())
                    .or_else(|| stream["nb_frames"].as_u64())
                    // Some containers omit nb_frames; estimate from duration.
                    .unwrap_or_else(|| (duration * ffmpeg::CANONICAL_FPS as f64) as u64);
            }
            Some("audio") => {
                probe.has_audio = true;
                probe.audio_duration = stream["duration"]
                    .as_str()
                    .and_then(|d| d.parse::<f64>().ok())
                    .or_else(|| stream["duration"].as_f64());
            }
            _ => {}
        }
    }

    Ok(probe)
}

/// The metadata-level checks. Pure over the probe so they are directly
/// testable.
pub fn run_probe_checks(
    reference: &str,
    probe: &ClipProbe,
    expected_duration: Option<f64>,
    config: &ClipVerifyConfig,
) -> VerificationReport {
    let mut report = VerificationReport::new(reference, "video");

    // Non-empty file.
    let file_check = if probe.file_bytes == 0 {
        Check::failed("file_size", Severity::Error)
    } else {
        Check::passed("file_size", Severity::Error)
    };
    report.push(file_check.expected("> 0 bytes").actual(probe.file_bytes));

    // Duration against expectation, when one was given.
    match expected_duration {
        Some(expected) => {
            let deviation = (probe.duration - expected).abs();
            let duration_check = if deviation <= config.duration_tolerance {
                Check::passed("duration", Severity::Error)
            } else {
                Check::failed("duration", Severity::Error)
            };
            report.push(
                duration_check
                    .expected(format!("{:.1}s ±{:.1}s", expected, config.duration_tolerance))
                    .actual(format!("{:.2}s", probe.duration)),
            );
        }
        None => report.push(Check::skipped("duration")),
    }

    // Minimum resolution.
    let resolution_check = if probe.width < config.min_width || probe.height < config.min_height {
        Check::failed("resolution", Severity::Error)
    } else {
        Check::passed("resolution", Severity::Error)
    };
    report.push(
        resolution_check
            .expected(format!(">= {}x{}", config.min_width, config.min_height))
            .actual(format!("{}x{}", probe.width, probe.height)),
    );

    // Frame count: zero frames is fatal, suspiciously few only warns.
    let frame_check = if probe.frame_count == 0 {
        Check::failed("frame_count", Severity::Error)
    } else if probe.frame_count < config.low_frame_warning {
        Check::warning("frame_count")
    } else {
        Check::passed("frame_count", Severity::Error)
    };
    report.push(
        frame_check
            .expected(format!(">= {}", config.low_frame_warning))
            .actual(probe.frame_count),
    );

    // Audio presence: absence is a warning, not a failure.
    if probe.has_audio {
        report.push(Check::passed("audio_track", Severity::Warning));

        match probe.audio_duration {
            Some(audio_duration) => {
                let drift = (audio_duration - probe.duration).abs();
                let sync_check = if drift <= config.av_sync_tolerance {
                    Check::passed("av_sync", Severity::Warning)
                } else {
                    Check::failed("av_sync", Severity::Warning)
                };
                report.push(
                    sync_check
                        .expected(format!("drift <= {:.1}s", config.av_sync_tolerance))
                        .actual(format!("{:.2}s", drift)),
                );
            }
            None => report.push(Check::skipped("av_sync")),
        }
    } else {
        report.push(Check::failed("audio_track", Severity::Warning).actual("no audio stream"));
        report.push(Check::skipped("av_sync"));
    }

    report
}

/// Classify a sampled frame as near-uniformly dark/bright, if it is.
pub fn classify_uniform_frame(
    stats: &super::image::ChannelStats,
    std_threshold: f64,
) -> Option<&'static str> {
    let max_std = stats.std_dev.iter().cloned().fold(0.0f64, f64::max);
    if max_std >= std_threshold {
        return None;
    }
    let mean = (stats.mean[0] + stats.mean[1] + stats.mean[2]) / 3.0;
    if mean < 32.0 {
        Some("dark")
    } else if mean > 223.0 {
        Some("bright")
    } else {
        None
    }
}

/// Verify a clip on disk. Probes metadata, then decodes sampled frames and
/// inspects the first/middle/last frames for near-uniform output.
pub async fn verify_clip(
    reference: &str,
    path: &Path,
    expected_duration: Option<f64>,
    config: &ClipVerifyConfig,
    runner: Arc<dyn CommandRunner>,
) -> VerificationReport {
    let file_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    if file_bytes == 0 {
        let mut report = VerificationReport::new(reference, "video");
        report.push(Check::failed("file_size", Severity::Error).expected("> 0 bytes").actual(0));
        for name in ["duration", "resolution", "frame_count", "audio_track", "av_sync", "frame_decode", "visual_consistency"] {
            report.push(Check::skipped(name));
        }
        return report;
    }

    let probe_output = ffmpeg::run_tool(runner.clone(), "ffprobe", ffmpeg::probe_args(path)).await;
    let probe = match probe_output.and_then(|out| parse_probe(&out, file_bytes)) {
        Ok(probe) => probe,
        Err(e) => {
            let mut report = VerificationReport::new(reference, "video");
            report.push(Check::failed("probe", Severity::Error).actual(e));
            return report;
        }
    };

    let mut report = run_probe_checks(reference, &probe, expected_duration, config);

    // Sampled-frame decode integrity: every Nth frame must decode to a
    // non-empty buffer.
    match sample_frames(path, config.frame_sample_interval, runner.clone()).await {
        Ok(frames) if !frames.is_empty() => {
            let undecodable = frames
                .iter()
                .filter(|bytes| bytes.is_empty() || image::load_from_memory(bytes).is_err())
                .count();
            let decode_check = if undecodable == 0 {
                Check::passed("frame_decode", Severity::Error)
            } else {
                Check::failed("frame_decode", Severity::Error)
            };
            report.push(
                decode_check
                    .expected("all sampled frames decode")
                    .actual(format!("{}/{} undecodable", undecodable, frames.len())),
            );
        }
        Ok(_) => {
            report.push(Check::failed("frame_decode", Severity::Error).actual("no frames extracted"));
        }
        Err(e) => {
            report.push(Check::failed("frame_decode", Severity::Error).actual(e));
        }
    }

    // Visual consistency: near-uniform first/middle/last frames are a likely
    // generation artifact. Warning only.
    let positions = [0.0, probe.duration / 2.0, (probe.duration - 0.1).max(0.0)];
    let mut uniform: Vec<String> = Vec::new();
    for (index, timestamp) in positions.iter().enumerate() {
        if let Ok(bytes) = frame_at(path, *timestamp, runner.clone()).await {
            if let Ok(frame) = image::load_from_memory(&bytes) {
                if let Some(kind) = classify_uniform_frame(&channel_stats(&frame), config.uniform_std_threshold) {
                    let name = ["first", "middle", "last"][index];
                    uniform.push(format!("{} frame {}", name, kind));
                }
            }
        }
    }
    let consistency_check = if uniform.is_empty() {
        Check::passed("visual_consistency", Severity::Warning)
    } else {
        Check::failed("visual_consistency", Severity::Warning).actual(uniform.join(", "))
    };
    report.push(consistency_check);

    report
}

async fn sample_frames(
    path: &Path,
    interval: u64,
    runner: Arc<dyn CommandRunner>,
) -> Result<Vec<Vec<u8>>, String> {
    let scratch = tempfile::TempDir::new().map_err(|e| format!("scratch dir failed: {}", e))?;
    let pattern = scratch.path().join("frame_%04d.png");

    ffmpeg::run_tool(runner, "ffmpeg", ffmpeg::sample_frames_args(path, &pattern, interval)).await?;

    let mut names: Vec<_> = std::fs::read_dir(scratch.path())
        .map_err(|e| format!("read scratch failed: {}", e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    names.sort();

    let mut frames = Vec::with_capacity(names.len());
    for name in names {
        frames.push(std::fs::read(&name).map_err(|e| format!("read frame failed: {}", e))?);
    }
    Ok(frames)
}

async fn frame_at(path: &Path, timestamp: f64, runner: Arc<dyn CommandRunner>) -> Result<Vec<u8>, String> {
    let scratch = tempfile::TempDir::new().map_err(|e| format!("scratch dir failed: {}", e))?;
    let output = scratch.path().join("frame.png");

    ffmpeg::run_tool(runner, "ffmpeg", ffmpeg::frame_at_args(path, timestamp, &output)).await?;

    std::fs::read(&output).map_err(|e| format!("read frame failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_probe() -> ClipProbe {
        ClipProbe {
            file_bytes: 2_000_000,
            duration: 10.2,
            width: 1920,
            height: 1080,
            frame_count: 306,
            has_audio: true,
            audio_duration: Some(10.1),
        }
    }

    fn config() -> ClipVerifyConfig {
        ClipVerifyConfig::default()
    }

    fn check<'a>(report: &'a VerificationReport, name: &str) -> &'a Check {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("missing check {}", name))
    }

    #[test]
    fn test_healthy_clip_passes_probe_checks() {
        let report = run_probe_checks("clip.mp4", &healthy_probe(), Some(10.0), &config());
        assert_eq!(report.overall, CheckStatus::Passed, "{:?}", report);
    }

    #[test]
    fn test_duration_outside_one_second_window_fails() {
        let mut probe = healthy_probe();
        probe.duration = 12.5;
        let report = run_probe_checks("clip.mp4", &probe, Some(10.0), &config());

        assert_eq!(check(&report, "duration").status, CheckStatus::Failed);
        assert_eq!(report.overall, CheckStatus::Failed);
    }

    #[test]
    fn test_duration_check_skipped_without_expectation() {
        let mut probe = healthy_probe();
        probe.duration = 12.5;
        let report = run_probe_checks("clip.mp4", &probe, None, &config());

        assert_eq!(check(&report, "duration").status, CheckStatus::Skipped);
        assert_eq!(report.overall, CheckStatus::Passed);
    }

    #[test]
    fn test_missing_audio_is_only_a_warning() {
        let mut probe = healthy_probe();
        probe.has_audio = false;
        probe.audio_duration = None;
        let report = run_probe_checks("clip.mp4", &probe, Some(10.0), &config());

        assert_eq!(check(&report, "audio_track").status, CheckStatus::Failed);
        assert_eq!(check(&report, "audio_track").severity, Severity::Warning);
        assert_eq!(check(&report, "av_sync").status, CheckStatus::Skipped);
        assert_eq!(report.overall, CheckStatus::Warning);
    }

    #[test]
    fn test_av_drift_warns() {
        let mut probe = healthy_probe();
        probe.audio_duration = Some(8.0);
        let report = run_probe_checks("clip.mp4", &probe, Some(10.0), &config());

        assert_eq!(check(&report, "av_sync").status, CheckStatus::Failed);
        assert_eq!(report.overall, CheckStatus::Warning);
    }

    #[test]
    fn test_zero_frames_is_fatal_and_few_frames_warn() {
        let mut probe = healthy_probe();
        probe.frame_count = 0;
        let report = run_probe_checks("clip.mp4", &probe, Some(10.0), &config());
        assert_eq!(report.overall, CheckStatus::Failed);

        probe.frame_count = 5;
        let report = run_probe_checks("clip.mp4", &probe, Some(10.0), &config());
        assert_eq!(check(&report, "frame_count").status, CheckStatus::Warning);
        assert_eq!(report.overall, CheckStatus::Warning);
    }

    #[test]
    fn test_probe_parsing_extracts_streams() {
        let json = r#"{
            "format": {"duration": "10.5"},
            "streams": [
                {"codec_type": "video", "width": 1920, "height": 1080, "nb_frames": "315"},
                {"codec_type": "audio", "duration": "10.4"}
            ]
        }"#;
        let probe = parse_probe(json, 1234).unwrap();

        assert_eq!(probe.file_bytes, 1234);
        assert!((probe.duration - 10.5).abs() < 1e-9);
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.frame_count, 315);
        assert!(probe.has_audio);
        assert_eq!(probe.audio_duration, Some(10.4));
    }

    #[test]
    fn test_uniform_frame_classification() {
        use super::super::image::ChannelStats;

        let dark = ChannelStats {
            mean: [4.0, 5.0, 6.0],
            std_dev: [1.0, 1.0, 1.0],
        };
        let bright = ChannelStats {
            mean: [250.0, 250.0, 248.0],
            std_dev: [2.0, 2.0, 2.0],
        };
        let busy = ChannelStats {
            mean: [120.0, 90.0, 60.0],
            std_dev: [40.0, 35.0, 30.0],
        };
        let flat_gray = ChannelStats {
            mean: [128.0, 128.0, 128.0],
            std_dev: [1.0, 1.0, 1.0],
        };

        assert_eq!(classify_uniform_frame(&dark, 6.0), Some("dark"));
        assert_eq!(classify_uniform_frame(&bright, 6.0), Some("bright"));
        assert_eq!(classify_uniform_frame(&busy, 6.0), None);
        // Mid-gray uniformity is not the dark/bright artifact this flags.
        assert_eq!(classify_uniform_frame(&flat_gray, 6.0), None);
    }
}
