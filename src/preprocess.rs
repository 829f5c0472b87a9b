use image::{imageops, GrayImage, RgbImage};
use imageproc::contrast::otsu_level;
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use ndarray::Array3;
use tracing::debug;

use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub height: u32,
    pub width: u32,
    /// Adaptive contrast enhancement (CLAHE) before resizing. Off by
    /// default; none of the bundled model families were trained on
    /// equalized inputs.
    pub enhance_contrast: bool,
    pub clahe_clip_limit: f32,
    pub clahe_grid: (u32, u32),
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            height: 256,
            width: 256,
            enhance_contrast: false,
            clahe_clip_limit: 2.0,
            clahe_grid: (8, 8),
        }
    }
}

#[derive(Debug)]
pub struct Processor {
    pub config: PreprocessConfig,
}

/// Decode uploaded bytes into an RGB pixel grid.
///
/// Empty or undecodable payloads are rejected here so the pipeline never
/// sees a null grid; callers skip the file and continue the batch.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Decode("empty upload".into()));
    }
    let img = image::load_from_memory(bytes)?.to_rgb8();
    if img.width() == 0 || img.height() == 0 {
        return Err(ServiceError::Decode("zero-area image".into()));
    }
    Ok(img)
}

impl Processor {
    /// Create a new instance of the Processor struct
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Preprocess one decoded image: background crop, optional contrast
    /// enhancement, resize to the model input size and scale into [0, 1].
    ///
    /// The returned grid always has shape (height, width, 3) regardless of
    /// the input image size or aspect ratio.
    pub fn preprocess(&self, raw: &RgbImage) -> Result<Array3<f32>, ServiceError> {
        let cropped = Self::crop_background(raw);
        debug!(
            from = ?raw.dimensions(),
            to = ?cropped.dimensions(),
            "background crop"
        );

        let enhanced = if self.config.enhance_contrast {
            self.equalize_contrast(&cropped)
        } else {
            cropped
        };

        self.resize_normalize(&enhanced)
    }

    /// Crop away the dark background around the wood sample.
    ///
    /// Binarizes with an Otsu threshold and crops to the bounding rectangle
    /// of the foreground. Runs twice: the first threshold can leave a
    /// residual border that the second pass tightens. Images with no
    /// foreground at all are returned unchanged.
    pub fn crop_background(img: &RgbImage) -> RgbImage {
        let mut out = img.clone();
        for _ in 0..2 {
            let Some((x0, y0, x1, y1)) = Self::foreground_bounds(&out) else {
                break;
            };
            let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
            if x0 == 0 && y0 == 0 && w == out.width() && h == out.height() {
                break;
            }
            out = imageops::crop_imm(&out, x0, y0, w, h).to_image();
        }
        out
    }

    /// Bounding rectangle (inclusive) of the Otsu-foreground pixels, or
    /// `None` when binarization leaves no pixel above the level.
    fn foreground_bounds(img: &RgbImage) -> Option<(u32, u32, u32, u32)> {
        let gray = imageops::grayscale(img);
        let level = otsu_level(&gray);

        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);
        let mut any = false;
        for (x, y, px) in gray.enumerate_pixels() {
            if px.0[0] > level {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
        any.then_some((min_x, min_y, max_x, max_y))
    }

    /// CLAHE on the grayscale channel, broadcast back to 3 channels.
    fn equalize_contrast(&self, img: &RgbImage) -> RgbImage {
        let gray = imageops::grayscale(img);
        let (gx, gy) = self.config.clahe_grid;
        let equalized = clahe(&gray, self.config.clahe_clip_limit, gx, gy);
        let mut out = RgbImage::new(img.width(), img.height());
        for (x, y, px) in equalized.enumerate_pixels() {
            let v = px.0[0];
            out.put_pixel(x, y, image::Rgb([v, v, v]));
        }
        out
    }

    /// Resize to the configured input size with a bilinear filter, then map
    /// 8-bit values into [0, 1].
    fn resize_normalize(&self, img: &RgbImage) -> Result<Array3<f32>, ServiceError> {
        let (w, h) = img.dimensions();
        let src = Image::from_vec_u8(w, h, img.as_raw().clone(), PixelType::U8x3)
            .map_err(|e| ServiceError::Preprocess(format!("source buffer: {e}")))?;
        let mut dst = Image::new(self.config.width, self.config.height, PixelType::U8x3);

        let mut resizer = Resizer::new();
        let options =
            ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
        resizer
            .resize(&src, &mut dst, Some(&options))
            .map_err(|e| ServiceError::Preprocess(format!("resize: {e}")))?;

        let (out_h, out_w) = (self.config.height as usize, self.config.width as usize);
        let mut grid = Array3::<f32>::zeros((out_h, out_w, 3));
        for (i, px) in dst.buffer().chunks_exact(3).enumerate() {
            let (y, x) = (i / out_w, i % out_w);
            grid[[y, x, 0]] = px[0] as f32 / 255.0;
            grid[[y, x, 1]] = px[1] as f32 / 255.0;
            grid[[y, x, 2]] = px[2] as f32 / 255.0;
        }
        Ok(grid)
    }
}

/// Contrast-limited adaptive histogram equalization.
///
/// One clipped-histogram LUT per tile; the per-pixel result is blended
/// bilinearly between the four surrounding tile LUTs to avoid visible tile
/// seams. Clipped mass is redistributed uniformly across all bins.
fn clahe(gray: &GrayImage, clip_limit: f32, grid_x: u32, grid_y: u32) -> GrayImage {
    let (width, height) = gray.dimensions();
    let (gx, gy) = (grid_x.max(1), grid_y.max(1));
    let tile_w = width.div_ceil(gx).max(1);
    let tile_h = height.div_ceil(gy).max(1);
    let nx = width.div_ceil(tile_w);
    let ny = height.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; (nx * ny) as usize];
    for ty in 0..ny {
        for tx in 0..nx {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            let area = ((x1 - x0) * (y1 - y0)) as f32;

            let mut hist = [0f32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y).0[0] as usize] += 1.0;
                }
            }

            let limit = (clip_limit * area / 256.0).max(1.0);
            let mut excess = 0.0;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bump = excess / 256.0;

            let lut = &mut luts[(ty * nx + tx) as usize];
            let mut cdf = 0.0;
            for (v, bin) in hist.iter().enumerate() {
                cdf += bin + bump;
                lut[v] = ((cdf / area) * 255.0).round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    let clamp_tile = |t: f32, n: u32| t.clamp(0.0, (n - 1) as f32) as u32;

    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let v = gray.get_pixel(x, y).0[0] as usize;
            let fx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let fy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
            let (bx, by) = (fx.floor(), fy.floor());
            let (wx, wy) = ((fx - bx).clamp(0.0, 1.0), (fy - by).clamp(0.0, 1.0));

            let (x0i, x1i) = (clamp_tile(bx, nx), clamp_tile(bx + 1.0, nx));
            let (y0i, y1i) = (clamp_tile(by, ny), clamp_tile(by + 1.0, ny));
            let l00 = luts[(y0i * nx + x0i) as usize][v] as f32;
            let l01 = luts[(y0i * nx + x1i) as usize][v] as f32;
            let l10 = luts[(y1i * nx + x0i) as usize][v] as f32;
            let l11 = luts[(y1i * nx + x1i) as usize][v] as f32;

            let top = (1.0 - wx) * l00 + wx * l01;
            let bottom = (1.0 - wx) * l10 + wx * l11;
            let blended = (1.0 - wy) * top + wy * bottom;
            out.put_pixel(x, y, image::Luma([blended.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn checkered(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([200, 180, 150])
            } else {
                Rgb([40, 30, 20])
            }
        })
    }

    /// Bright plank centered on a dark background.
    fn plank_on_background(width: u32, height: u32) -> RgbImage {
        let mut img = RgbImage::from_pixel(width, height, Rgb([5, 5, 5]));
        for y in height / 4..height * 3 / 4 {
            for x in width / 4..width * 3 / 4 {
                img.put_pixel(x, y, Rgb([190, 160, 120]));
            }
        }
        img
    }

    #[test]
    fn preprocess_always_yields_unit_range_256() {
        let processor = Processor::new(PreprocessConfig::default());
        for img in [
            checkered(512, 512),
            checkered(123, 77),
            plank_on_background(640, 480),
            RgbImage::from_pixel(32, 32, Rgb([128, 128, 128])),
        ] {
            let grid = processor.preprocess(&img).unwrap();
            assert_eq!(grid.shape(), &[256, 256, 3]);
            assert!(grid.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn crop_finds_bright_foreground() {
        let img = plank_on_background(400, 400);
        let cropped = Processor::crop_background(&img);
        assert_eq!(cropped.dimensions(), (200, 200));
        assert_eq!(cropped.get_pixel(0, 0).0, [190, 160, 120]);
    }

    #[test]
    fn crop_is_idempotent_on_tight_image() {
        let img = plank_on_background(400, 400);
        let once = Processor::crop_background(&img);
        let twice = Processor::crop_background(&once);
        assert_eq!(once.dimensions(), twice.dimensions());
        assert_eq!(once.as_raw(), twice.as_raw());
    }

    #[test]
    fn crop_skips_images_without_foreground() {
        // A constant image binarizes to all-zero, so the crop stage must
        // pass the grid through unchanged.
        let img = RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]));
        let cropped = Processor::crop_background(&img);
        assert_eq!(cropped.dimensions(), (64, 48));
    }

    #[test]
    fn constant_white_image_survives_full_pipeline() {
        let processor = Processor::new(PreprocessConfig::default());
        let img = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        let grid = processor.preprocess(&img).unwrap();
        assert_eq!(grid.shape(), &[256, 256, 3]);
        assert!(grid.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn clahe_preserves_dimensions_and_broadcasts_channels() {
        let img = checkered(100, 60);
        let processor = Processor::new(PreprocessConfig {
            enhance_contrast: true,
            ..PreprocessConfig::default()
        });
        let out = processor.equalize_contrast(&img);
        assert_eq!(out.dimensions(), (100, 60));
        let px = out.get_pixel(3, 3).0;
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }

    #[test]
    fn clahe_spreads_a_narrow_histogram() {
        // Low-contrast texture (values 120..=134): equalization should widen
        // the value spread well beyond the original 14 levels.
        let img = GrayImage::from_fn(64, 64, |x, y| image::Luma([120 + (x % 8 + y % 8) as u8]));
        let out = clahe(&img, 2.0, 8, 8);
        let (lo, hi) = out
            .pixels()
            .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        assert!(hi - lo > 30, "spread {lo}..{hi} too narrow");
    }

    #[test]
    fn decode_rejects_garbage_and_empty_input() {
        assert!(matches!(decode_image(&[]), Err(ServiceError::Decode(_))));
        assert!(matches!(
            decode_image(b"definitely not an image"),
            Err(ServiceError::Decode(_))
        ));
    }

    #[test]
    fn decode_roundtrips_png_bytes() {
        let img = checkered(20, 20);
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        let decoded = decode_image(buf.get_ref()).unwrap();
        assert_eq!(decoded.dimensions(), (20, 20));
    }
}
