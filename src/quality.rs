//! Image quality heuristics
//!
//! Blur is estimated with the variance of a Laplacian filter over the
//! grayscale image, exposure with mean brightness. The thresholds are tuned
//! for hand-held field photos; an image failing the hard gate is recorded
//! but never analyzed.

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Laplacian variance below which an image counts as blurry
const BLUR_THRESHOLD: f64 = 100.0;
/// Laplacian variance below which a blurry image is unusable
const SEVERE_BLUR_THRESHOLD: f64 = 50.0;
/// Mean brightness bounds for under/over exposure
const UNDEREXPOSED_THRESHOLD: f64 = 50.0;
const OVEREXPOSED_THRESHOLD: f64 = 200.0;
/// Mean brightness bounds beyond which an image is unusable
const EXTREME_DARK_THRESHOLD: f64 = 20.0;
const EXTREME_BRIGHT_THRESHOLD: f64 = 240.0;

/// Outcome of assessing one uploaded image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub is_blurry: bool,
    pub is_underexposed: bool,
    pub is_overexposed: bool,
    pub notes: String,
    pub laplacian_variance: f64,
    pub mean_brightness: f64,
}

impl QualityAssessment {
    /// Hard gate: true when the image is too degraded to analyze
    pub fn is_unusable(&self) -> bool {
        (self.is_blurry && self.laplacian_variance < SEVERE_BLUR_THRESHOLD)
            || self.mean_brightness < EXTREME_DARK_THRESHOLD
            || self.mean_brightness > EXTREME_BRIGHT_THRESHOLD
    }

    fn acceptable() -> Self {
        Self {
            is_blurry: false,
            is_underexposed: false,
            is_overexposed: false,
            notes: "Image quality acceptable".to_string(),
            laplacian_variance: 1000.0,
            mean_brightness: 128.0,
        }
    }
}

/// Assess blur and exposure of an encoded image.
///
/// Never fails: an undecodable image yields the acceptable defaults with an
/// explanatory note, leaving the usability decision to the prediction step.
pub fn assess(image_bytes: &[u8]) -> QualityAssessment {
    let gray = match image::load_from_memory(image_bytes) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            let mut assessment = QualityAssessment::acceptable();
            assessment.notes = format!("Quality assessment error: {e}");
            return assessment;
        }
    };

    let laplacian_variance = laplacian_variance(&gray);
    let mean_brightness = mean_brightness(&gray);

    let is_blurry = laplacian_variance < BLUR_THRESHOLD;
    let is_underexposed = mean_brightness < UNDEREXPOSED_THRESHOLD;
    let is_overexposed = mean_brightness > OVEREXPOSED_THRESHOLD;

    let mut notes = Vec::new();
    if is_blurry {
        notes.push("Image appears blurry");
    }
    if is_underexposed {
        notes.push("Image appears underexposed");
    }
    if is_overexposed {
        notes.push("Image appears overexposed");
    }
    if notes.is_empty() {
        notes.push("Image quality acceptable");
    }

    QualityAssessment {
        is_blurry,
        is_underexposed,
        is_overexposed,
        notes: notes.join("; "),
        laplacian_variance,
        mean_brightness,
    }
}

/// Variance of the 4-connected Laplacian over interior pixels
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let mut values = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let center = gray.get_pixel(x, y)[0] as f64;
            let laplacian = gray.get_pixel(x, y - 1)[0] as f64
                + gray.get_pixel(x, y + 1)[0] as f64
                + gray.get_pixel(x - 1, y)[0] as f64
                + gray.get_pixel(x + 1, y)[0] as f64
                - 4.0 * center;
            values.push(laplacian);
        }
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}

fn mean_brightness(gray: &GrayImage) -> f64 {
    let total: u64 = gray.pixels().map(|p| p[0] as u64).sum();
    total as f64 / (gray.width() as u64 * gray.height() as u64) as f64
}
