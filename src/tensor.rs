use ndarray::{Array3, Array4};

/// Per-channel standardization constants matching the scale the bundled
/// models were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Convert a preprocessed (H, W, 3) grid in [0, 1] into the (1, 3, H, W)
/// channel-major tensor layout the scoring models consume.
///
/// The grid is already in RGB order (the decoder produces RGB), so only the
/// layout changes. Standardization is model-specific metadata: it is applied
/// only when the selected scorer reports that its weights expect it.
pub fn to_tensor(grid: &Array3<f32>, standardize: bool) -> Array4<f32> {
    let (h, w, c) = grid.dim();
    debug_assert_eq!(c, 3);

    let mut tensor = Array4::<f32>::zeros((1, c, h, w));
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                let mut v = grid[[y, x, ch]];
                if standardize {
                    v = (v - IMAGENET_MEAN[ch]) / IMAGENET_STD[ch];
                }
                tensor[[0, ch, y, x]] = v;
            }
        }
    }
    tensor
}
