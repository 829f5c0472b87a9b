use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array3;
use serde::Serialize;

use crate::error::ServiceError;

/// Placeholder quality metrics. Ground-truth evaluation is out of scope;
/// these fixed values keep the response shape the frontend consumes.
pub const PLACEHOLDER_F1: f32 = 0.87;
pub const PLACEHOLDER_IOU: f32 = 0.76;

/// Per-file response record. Immutable once assembled; the response list
/// carries these in upload order.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub filename: String,
    pub model: String,
    pub f1_score: f32,
    pub iou: f32,
    /// Binary anomaly mask as a PNG data URI.
    pub mask: String,
    /// Jet heatmap as a PNG data URI.
    pub heatmap: String,
    /// The preprocessed input as a PNG data URI, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<String>,
}

/// PNG-encode an image and wrap it as a `data:image/png;base64,` URI,
/// ready for a JSON payload or an `<img>` tag.
pub fn to_png_data_uri(img: &DynamicImage) -> Result<String, ServiceError> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| ServiceError::Encode(format!("png: {e}")))?;
    Ok(format!(
        "data:image/png;base64,{}",
        STANDARD.encode(buf.get_ref())
    ))
}

/// Re-quantize a normalized (H, W, 3) grid back into an 8-bit image, for
/// returning the preprocessed input to the caller.
pub fn grid_to_image(grid: &Array3<f32>) -> RgbImage {
    let (h, w, _) = grid.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |ch: usize| {
            (grid[[y as usize, x as usize, ch]].clamp(0.0, 1.0) * 255.0).round() as u8
        };
        Rgb([px(0), px(1), px(2)])
    })
}
