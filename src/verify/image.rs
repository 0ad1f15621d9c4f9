// src/verify/image.rs
//! Image verification: decode integrity, geometry, blank-frame statistics,
//! and a combined sharpness/entropy quality score.
//!
//! Everything here is a pure function of the input bytes, so repeated runs on
//! identical bytes produce identical reports.

use image::{DynamicImage, GenericImageView, ImageFormat};

use super::{Check, CheckStatus, Severity, VerificationReport};

#[derive(Debug, Clone)]
pub struct ImageVerifyConfig {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub min_width: u32,
    pub min_height: u32,
    pub allowed_formats: Vec<ImageFormat>,
    /// Expected width/height ratio, with a relative tolerance window.
    pub expected_aspect: Option<f64>,
    pub aspect_tolerance: f64,
    /// Per-channel standard deviation below which a frame counts as blank.
    pub blank_std_threshold: f64,
    /// Quality scores below this raise a warning.
    pub min_quality_score: f64,
}

impl Default for ImageVerifyConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1024,
            max_bytes: 20 * 1024 * 1024,
            min_width: 512,
            min_height: 512,
            allowed_formats: vec![ImageFormat::Png, ImageFormat::Jpeg, ImageFormat::WebP],
            expected_aspect: Some(16.0 / 9.0),
            aspect_tolerance: 0.05,
            blank_std_threshold: 6.0,
            min_quality_score: 25.0,
        }
    }
}

/// Mean and standard deviation per RGB channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelStats {
    pub mean: [f64; 3],
    pub std_dev: [f64; 3],
}

pub fn verify_image(reference: &str, bytes: &[u8], config: &ImageVerifyConfig) -> VerificationReport {
    let mut report = VerificationReport::new(reference, "image");

    // File-size bounds.
    let size_check = if bytes.len() < config.min_bytes || bytes.len() > config.max_bytes {
        Check::failed("file_size", Severity::Error)
    } else {
        Check::passed("file_size", Severity::Error)
    };
    report.push(
        size_check
            .expected(format!("{}..{} bytes", config.min_bytes, config.max_bytes))
            .actual(bytes.len()),
    );

    // Format allow-list.
    let format = image::guess_format(bytes).ok();
    let format_allowed = format.map(|f| config.allowed_formats.contains(&f)).unwrap_or(false);
    let format_check = if format_allowed {
        Check::passed("format", Severity::Error)
    } else {
        Check::failed("format", Severity::Error)
    };
    report.push(
        format_check
            .expected(format!("{:?}", config.allowed_formats))
            .actual(format.map(|f| format!("{:?}", f)).unwrap_or_else(|| "unknown".to_string())),
    );

    // Decode-time integrity. Without pixels the remaining checks cannot run
    // and are recorded as skipped.
    let decoded = match image::load_from_memory(bytes) {
        Ok(img) => {
            report.push(Check::passed("corruption", Severity::Error));
            img
        }
        Err(e) => {
            report.push(Check::failed("corruption", Severity::Error).actual(e.to_string()));
            for name in ["resolution", "aspect_ratio", "blank_frame", "quality_score"] {
                report.push(Check::skipped(name));
            }
            return report;
        }
    };

    let (width, height) = decoded.dimensions();

    // Minimum resolution.
    let resolution_check = if width < config.min_width || height < config.min_height {
        Check::failed("resolution", Severity::Error)
    } else {
        Check::passed("resolution", Severity::Error)
    };
    report.push(
        resolution_check
            .expected(format!(">= {}x{}", config.min_width, config.min_height))
            .actual(format!("{}x{}", width, height)),
    );

    // Aspect-ratio window. A padded/cropped image is still usable, so this
    // only warns.
    match config.expected_aspect {
        Some(expected) if height > 0 => {
            let actual = width as f64 / height as f64;
            let deviation = (actual - expected).abs() / expected;
            let aspect_check = if deviation <= config.aspect_tolerance {
                Check::passed("aspect_ratio", Severity::Warning)
            } else {
                Check::failed("aspect_ratio", Severity::Warning)
            };
            report.push(
                aspect_check
                    .expected(format!("{:.3} ±{:.0}%", expected, config.aspect_tolerance * 100.0))
                    .actual(format!("{:.3}", actual)),
            );
        }
        _ => report.push(Check::skipped("aspect_ratio")),
    }

    // Blank-frame detection via per-channel standard deviation, with separate
    // classification for all-black, all-white, and merely low-variance.
    let stats = channel_stats(&decoded);
    let max_std = stats.std_dev.iter().cloned().fold(0.0f64, f64::max);
    let mean_luma = (stats.mean[0] + stats.mean[1] + stats.mean[2]) / 3.0;

    if max_std < config.blank_std_threshold {
        let classification = if mean_luma < 16.0 {
            "all_black"
        } else if mean_luma > 239.0 {
            "all_white"
        } else {
            "low_variance"
        };
        let blank_check = if classification == "low_variance" {
            Check::warning("blank_frame")
        } else {
            Check::failed("blank_frame", Severity::Error)
        };
        report.push(
            blank_check
                .expected(format!("channel std >= {:.1}", config.blank_std_threshold))
                .actual(format!("{} (std {:.2}, mean {:.1})", classification, max_std, mean_luma)),
        );
    } else {
        report.push(
            Check::passed("blank_frame", Severity::Error).actual(format!("std {:.2}", max_std)),
        );
    }

    // Quality score: 60% sharpness (local-gradient variance), 40% Shannon
    // entropy of the intensity histogram.
    let score = quality_score(&decoded);
    let quality_check = if score < config.min_quality_score {
        Check::warning("quality_score")
    } else {
        Check::passed("quality_score", Severity::Warning)
    };
    report.push(
        quality_check
            .expected(format!(">= {:.0}", config.min_quality_score))
            .actual(format!("{:.1}", score)),
    );

    report
}

pub fn channel_stats(image: &DynamicImage) -> ChannelStats {
    let rgb = image.to_rgb8();
    let pixel_count = (rgb.width() as u64 * rgb.height() as u64).max(1) as f64;

    let mut sums = [0.0f64; 3];
    let mut sq_sums = [0.0f64; 3];
    for pixel in rgb.pixels() {
        for channel in 0..3 {
            let value = pixel.0[channel] as f64;
            sums[channel] += value;
            sq_sums[channel] += value * value;
        }
    }

    let mut mean = [0.0f64; 3];
    let mut std_dev = [0.0f64; 3];
    for channel in 0..3 {
        mean[channel] = sums[channel] / pixel_count;
        let variance = (sq_sums[channel] / pixel_count) - mean[channel] * mean[channel];
        std_dev[channel] = variance.max(0.0).sqrt();
    }

    ChannelStats { mean, std_dev }
}

/// 0-100 score combining sharpness and tonal richness, weighted 60/40.
pub fn quality_score(image: &DynamicImage) -> f64 {
    let luma = image.to_luma8();
    let sharpness = sharpness_score(&luma);
    let entropy = entropy_score(&luma);
    sharpness * 0.6 + entropy * 0.4
}

/// Variance of the local gradient magnitude, squashed onto 0-100. Soft
/// images have near-uniform (tiny) gradients and score low.
fn sharpness_score(luma: &image::GrayImage) -> f64 {
    let (width, height) = luma.dimensions();
    if width < 2 || height < 2 {
        return 0.0;
    }

    let mut gradients = Vec::with_capacity(((width - 1) * (height - 1)) as usize);
    for y in 0..height - 1 {
        for x in 0..width - 1 {
            let here = luma.get_pixel(x, y).0[0] as f64;
            let right = luma.get_pixel(x + 1, y).0[0] as f64;
            let below = luma.get_pixel(x, y + 1).0[0] as f64;
            let gx = right - here;
            let gy = below - here;
            gradients.push((gx * gx + gy * gy).sqrt());
        }
    }

    let count = gradients.len() as f64;
    let mean = gradients.iter().sum::<f64>() / count;
    let variance = gradients.iter().map(|g| (g - mean) * (g - mean)).sum::<f64>() / count;

    // Gradient variance around ~400 is a comfortably sharp photo.
    ((variance / 400.0) * 100.0).min(100.0)
}

/// Shannon entropy of the 256-bin intensity histogram, scaled so the
/// 8-bit maximum maps to 100.
fn entropy_score(luma: &image::GrayImage) -> f64 {
    let mut histogram = [0u64; 256];
    for pixel in luma.pixels() {
        histogram[pixel.0[0] as usize] += 1;
    }

    let total = luma.pixels().len() as f64;
    if total == 0.0 {
        return 0.0;
    }

    let mut entropy = 0.0f64;
    for &count in &histogram {
        if count > 0 {
            let p = count as f64 / total;
            entropy -= p * p.log2();
        }
    }

    (entropy / 8.0) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn png_bytes(image: ImageBuffer<Rgb<u8>, Vec<u8>>) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn uniform(width: u32, height: u32, value: u8) -> Vec<u8> {
        png_bytes(ImageBuffer::from_pixel(width, height, Rgb([value, value, value])))
    }

    /// Deterministic textured image: a hash-noise pattern so both sharpness
    /// and entropy are non-trivial.
    fn textured(width: u32, height: u32) -> Vec<u8> {
        png_bytes(ImageBuffer::from_fn(width, height, |x, y| {
            let hash = x
                .wrapping_mul(31)
                .wrapping_add(y.wrapping_mul(57))
                .wrapping_mul(2654435761);
            Rgb([hash as u8, (hash >> 8) as u8, (hash >> 16) as u8])
        }))
    }

    fn config() -> ImageVerifyConfig {
        ImageVerifyConfig {
            min_bytes: 64,
            min_width: 320,
            min_height: 180,
            expected_aspect: Some(16.0 / 9.0),
            ..ImageVerifyConfig::default()
        }
    }

    fn check<'a>(report: &'a VerificationReport, name: &str) -> &'a Check {
        report
            .checks
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("missing check {}", name))
    }

    #[test]
    fn test_textured_image_passes() {
        let bytes = textured(640, 360);
        let report = verify_image("ok.png", &bytes, &config());

        assert_eq!(report.overall, CheckStatus::Passed, "{:?}", report);
        assert_eq!(check(&report, "blank_frame").status, CheckStatus::Passed);
    }

    #[test]
    fn test_all_black_image_fails_blank_check() {
        let bytes = uniform(640, 360, 0);
        let report = verify_image("black.png", &bytes, &config());

        let blank = check(&report, "blank_frame");
        assert_eq!(blank.status, CheckStatus::Failed);
        assert!(blank.actual.as_deref().unwrap().contains("all_black"));
        assert_eq!(report.overall, CheckStatus::Failed);
    }

    #[test]
    fn test_all_white_image_fails_blank_check() {
        let bytes = uniform(640, 360, 255);
        let report = verify_image("white.png", &bytes, &config());

        let blank = check(&report, "blank_frame");
        assert_eq!(blank.status, CheckStatus::Failed);
        assert!(blank.actual.as_deref().unwrap().contains("all_white"));
    }

    #[test]
    fn test_mid_gray_image_is_low_variance_warning_only() {
        let bytes = uniform(640, 360, 128);
        let report = verify_image("gray.png", &bytes, &config());

        let blank = check(&report, "blank_frame");
        assert!(blank.actual.as_deref().unwrap().contains("low_variance"));
        // Low variance alone never hard-fails the asset.
        assert_eq!(report.overall, CheckStatus::Warning);
    }

    #[test]
    fn test_undecodable_bytes_fail_corruption_and_skip_pixel_checks() {
        let mut cfg = config();
        cfg.min_bytes = 1;
        let report = verify_image("junk.bin", b"definitely not an image", &cfg);

        assert_eq!(check(&report, "corruption").status, CheckStatus::Failed);
        assert_eq!(check(&report, "blank_frame").status, CheckStatus::Skipped);
        assert_eq!(report.overall, CheckStatus::Failed);
    }

    #[test]
    fn test_small_image_fails_resolution() {
        let bytes = textured(64, 36);
        let mut cfg = config();
        cfg.min_bytes = 1;
        let report = verify_image("tiny.png", &bytes, &cfg);

        assert_eq!(check(&report, "resolution").status, CheckStatus::Failed);
    }

    #[test]
    fn test_square_image_warns_on_aspect_ratio() {
        let bytes = textured(360, 360);
        let report = verify_image("square.png", &bytes, &config());

        let aspect = check(&report, "aspect_ratio");
        assert_eq!(aspect.status, CheckStatus::Failed);
        assert_eq!(aspect.severity, Severity::Warning);
        // A bad aspect ratio alone must not fail the asset outright.
        assert_ne!(report.overall, CheckStatus::Failed);
    }

    #[test]
    fn test_verification_is_idempotent() {
        let bytes = textured(640, 360);
        let cfg = config();

        let first = verify_image("same.png", &bytes, &cfg);
        let second = verify_image("same.png", &bytes, &cfg);

        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }
}
