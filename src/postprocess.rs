use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array2;

/// Guards the min-max rescale against a uniform score grid.
pub const NORM_EPSILON: f32 = 1e-8;

/// Turn a raw score grid into the binary anomaly mask and the color
/// heatmap.
///
/// `threshold` is the cutoff applied to the min-max normalized scores;
/// deployments have run anywhere from 0.32 to 0.5, so it is a parameter of
/// the service configuration rather than a constant.
pub fn postprocess(scores: &Array2<f32>, threshold: f32) -> (GrayImage, RgbImage) {
    let normalized = normalize_scores(scores);
    (
        threshold_mask(&normalized, threshold),
        render_heatmap(&normalized),
    )
}

/// Rescale a raw score grid so min maps to 0 and max to 1. A uniform grid
/// normalizes to all-zero instead of dividing by zero.
pub fn normalize_scores(scores: &Array2<f32>) -> Array2<f32> {
    let min = scores.iter().copied().fold(f32::INFINITY, f32::min);
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    scores.mapv(|v| (v - min) / (max - min + NORM_EPSILON))
}

/// Binarize normalized scores: strictly above the threshold is anomalous
/// (255), everything else is background (0).
pub fn threshold_mask(normalized: &Array2<f32>, threshold: f32) -> GrayImage {
    let (h, w) = normalized.dim();
    let mut mask = GrayImage::new(w as u32, h as u32);
    for ((y, x), &v) in normalized.indexed_iter() {
        let bit = if v > threshold { 255 } else { 0 };
        mask.put_pixel(x as u32, y as u32, Luma([bit]));
    }
    mask
}

/// Map normalized scores through the jet palette (blue for normal, red for
/// anomalous) into an RGB heatmap.
pub fn render_heatmap(normalized: &Array2<f32>) -> RgbImage {
    let (h, w) = normalized.dim();
    let mut heatmap = RgbImage::new(w as u32, h as u32);
    for ((y, x), &v) in normalized.indexed_iter() {
        let level = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        heatmap.put_pixel(x as u32, y as u32, Rgb(jet_color(level)));
    }
    heatmap
}

/// Classic piecewise-linear jet ramp: dark blue → cyan → yellow → red.
fn jet_color(level: u8) -> [u8; 3] {
    let x = level as f32 / 255.0;
    let r = (1.5 - (4.0 * x - 3.0).abs()).clamp(0.0, 1.0);
    let g = (1.5 - (4.0 * x - 2.0).abs()).clamp(0.0, 1.0);
    let b = (1.5 - (4.0 * x - 1.0).abs()).clamp(0.0, 1.0);
    [
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8,
    ]
}
