use std::path::Path;
use std::sync::Mutex;

use ndarray::{s, Array2, Array4, ArrayD, Axis, CowArray, Ix4};
use tracing::debug;

use crate::error::ServiceError;
use crate::model::OnnxModel;

/// A loaded anomaly-scoring model.
///
/// Implementations are strategies over `score`: tensor in, raw per-pixel
/// score grid out, at the input's spatial resolution. Internal composition
/// (single network vs. ensemble) stays behind this trait.
pub trait AnomalyScorer: Send + Sync {
    /// Whether this model's weights expect per-channel standardized input.
    fn standardized_input(&self) -> bool;

    /// Score one (1, 3, H, W) tensor into an (H, W) raw anomaly grid.
    /// No value range is guaranteed.
    fn score(&self, input: &Array4<f32>) -> Result<Array2<f32>, ServiceError>;
}

/// EfficientAD-family scorer: a fixed teacher network, a student network
/// with twice the teacher's channels, and an autoencoder, all over the same
/// input.
pub struct EfficientAd {
    // `ort::Session::run` takes `&mut self`, but `AnomalyScorer::score` (and the
    // `Arc<dyn AnomalyScorer>` the service shares) hand out only `&self`. The
    // sessions live behind a `Mutex` so scoring stays `&self` without changing
    // the trait; runs are sequential so the lock is uncontended.
    teacher: Mutex<ort::session::Session>,
    student: Mutex<ort::session::Session>,
    autoencoder: Mutex<ort::session::Session>,
}

impl EfficientAd {
    pub const WEIGHT_FILES: [&'static str; 3] = [
        "teacher_final.onnx",
        "student_final.onnx",
        "autoencoder_final.onnx",
    ];

    /// Load the three sub-networks from `model_dir`.
    pub fn load(model_dir: &Path, cuda: bool) -> Result<Self, ServiceError> {
        let loader = OnnxModel::new(cuda);
        let [teacher, student, autoencoder] = Self::WEIGHT_FILES;
        Ok(Self {
            teacher: Mutex::new(loader.load_model(&model_dir.join(teacher))?),
            student: Mutex::new(loader.load_model(&model_dir.join(student))?),
            autoencoder: Mutex::new(loader.load_model(&model_dir.join(autoencoder))?),
        })
    }
}

impl AnomalyScorer for EfficientAd {
    fn standardized_input(&self) -> bool {
        true
    }

    fn score(&self, input: &Array4<f32>) -> Result<Array2<f32>, ServiceError> {
        let (h, w) = (input.shape()[2], input.shape()[3]);

        let teacher_out = run_first_output(&self.teacher, input)?;
        let student_out = run_first_output(&self.student, input)?;
        let ae_out = run_first_output(&self.autoencoder, input)?;
        debug!(
            teacher = ?teacher_out.shape(),
            student = ?student_out.shape(),
            autoencoder = ?ae_out.shape(),
            "sub-network outputs"
        );

        let combined = combine_feature_maps(&teacher_out, &student_out, &ae_out)?;
        // The sub-networks emit feature-resolution maps; the scorer contract
        // promises the input's spatial resolution.
        Ok(upsample_bilinear(&combined, h, w))
    }
}

/// Run a session on one tensor and extract its first output as f32.
fn run_first_output(
    session: &Mutex<ort::session::Session>,
    input: &Array4<f32>,
) -> Result<ArrayD<f32>, ServiceError> {
    let data = CowArray::from(input.view().into_dyn());
    let tensor = ort::value::TensorRef::from_array_view(&data)?;
    let mut session = session.lock().expect("model session mutex poisoned");
    let outputs = session.run(ort::inputs![tensor])?;
    let first = outputs
        .iter()
        .map(|(_name, value)| value.try_extract_array::<f32>().map(|v| v.into_owned()))
        .next()
        .ok_or_else(|| ServiceError::Inference("model produced no outputs".into()))?;
    Ok(first?)
}

/// Blend the three sub-network outputs into one 2-D anomaly map.
///
/// The student's first `C` channels approximate the teacher, its second `C`
/// channels approximate the autoencoder reconstruction, where `C` is the
/// teacher's channel count. The two mean-squared discrepancy maps are
/// averaged with equal weight; this split point and blend are fixed
/// properties of the model family.
pub(crate) fn combine_feature_maps(
    teacher: &ArrayD<f32>,
    student: &ArrayD<f32>,
    autoencoder: &ArrayD<f32>,
) -> Result<Array2<f32>, ServiceError> {
    let as_4d = |name: &str, arr: &ArrayD<f32>| {
        arr.view()
            .into_dimensionality::<Ix4>()
            .map_err(|_| {
                ServiceError::Inference(format!(
                    "{name} output has shape {:?}, expected 4 dimensions",
                    arr.shape()
                ))
            })
            .map(|v| v.to_owned())
    };
    let t = as_4d("teacher", teacher)?;
    let s = as_4d("student", student)?;
    let a = as_4d("autoencoder", autoencoder)?;

    let c = t.shape()[1];
    if s.shape()[1] != 2 * c {
        return Err(ServiceError::Inference(format!(
            "student output has {} channels, expected {}",
            s.shape()[1],
            2 * c
        )));
    }
    if a.shape() != t.shape() || s.shape()[2..] != t.shape()[2..] {
        return Err(ServiceError::Inference(format!(
            "mismatched feature maps: teacher {:?}, student {:?}, autoencoder {:?}",
            t.shape(),
            s.shape(),
            a.shape()
        )));
    }

    let st_part = s.slice(s![.., ..c, .., ..]);
    let ae_part = s.slice(s![.., c.., .., ..]);

    let no_channels = || ServiceError::Inference("feature maps have no channels".into());
    let map_st = (&t - &st_part)
        .mapv(|v| v * v)
        .mean_axis(Axis(1))
        .ok_or_else(no_channels)?;
    let map_ae = (&a - &ae_part)
        .mapv(|v| v * v)
        .mean_axis(Axis(1))
        .ok_or_else(no_channels)?;

    let combined = 0.5 * &map_st + 0.5 * &map_ae;
    Ok(combined.index_axis(Axis(0), 0).to_owned())
}

/// Bilinear upsample of a score map. Identity when sizes already match.
pub(crate) fn upsample_bilinear(map: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (h, w) = map.dim();
    if h == out_h && w == out_w {
        return map.clone();
    }
    let sy = h as f32 / out_h as f32;
    let sx = w as f32 / out_w as f32;

    let mut out = Array2::<f32>::zeros((out_h, out_w));
    for oy in 0..out_h {
        let fy = ((oy as f32 + 0.5) * sy - 0.5).clamp(0.0, (h - 1) as f32);
        let y0 = fy.floor() as usize;
        let y1 = (y0 + 1).min(h - 1);
        let wy = fy - y0 as f32;
        for ox in 0..out_w {
            let fx = ((ox as f32 + 0.5) * sx - 0.5).clamp(0.0, (w - 1) as f32);
            let x0 = fx.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let wx = fx - x0 as f32;

            let top = map[[y0, x0]] * (1.0 - wx) + map[[y0, x1]] * wx;
            let bottom = map[[y1, x0]] * (1.0 - wx) + map[[y1, x1]] * wx;
            out[[oy, ox]] = top * (1.0 - wy) + bottom * wy;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn combination_matches_hand_computed_blend() {
        // teacher/autoencoder: (1, 2, 2, 2); student: (1, 4, 2, 2).
        let teacher = Array::from_shape_vec((1, 2, 2, 2), vec![1.0; 8])
            .unwrap()
            .into_dyn();
        let autoencoder = Array::from_shape_vec((1, 2, 2, 2), vec![2.0; 8])
            .unwrap()
            .into_dyn();
        // First half 3.0 (vs teacher 1.0 -> sq err 4.0), second half 5.0
        // (vs autoencoder 2.0 -> sq err 9.0).
        let student = Array::from_shape_vec(
            (1, 4, 2, 2),
            [vec![3.0; 4], vec![3.0; 4], vec![5.0; 4], vec![5.0; 4]].concat(),
        )
        .unwrap()
        .into_dyn();

        let combined = combine_feature_maps(&teacher, &student, &autoencoder).unwrap();
        assert_eq!(combined.dim(), (2, 2));
        // 0.5 * 4.0 + 0.5 * 9.0 = 6.5 everywhere.
        assert!(combined.iter().all(|&v| (v - 6.5).abs() < 1e-6));
    }

    #[test]
    fn combination_varies_per_pixel() {
        let teacher = Array::from_shape_vec((1, 1, 1, 2), vec![0.0, 0.0])
            .unwrap()
            .into_dyn();
        let autoencoder = teacher.clone();
        let student = Array::from_shape_vec((1, 2, 1, 2), vec![1.0, 2.0, 0.0, 0.0])
            .unwrap()
            .into_dyn();

        let combined = combine_feature_maps(&teacher, &student, &autoencoder).unwrap();
        assert!((combined[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((combined[[0, 1]] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn combination_rejects_bad_student_split() {
        let teacher = ArrayD::<f32>::zeros(vec![1, 2, 2, 2]);
        let autoencoder = ArrayD::<f32>::zeros(vec![1, 2, 2, 2]);
        let student = ArrayD::<f32>::zeros(vec![1, 3, 2, 2]);
        assert!(matches!(
            combine_feature_maps(&teacher, &student, &autoencoder),
            Err(ServiceError::Inference(_))
        ));
    }

    #[test]
    fn upsample_is_identity_at_same_size() {
        let map = Array2::from_shape_fn((4, 4), |(y, x)| (y * 4 + x) as f32);
        let up = upsample_bilinear(&map, 4, 4);
        assert_eq!(map, up);
    }

    #[test]
    fn upsample_preserves_value_bounds() {
        let map = Array2::from_shape_fn((8, 8), |(y, x)| ((y * x) % 5) as f32);
        let up = upsample_bilinear(&map, 256, 256);
        assert_eq!(up.dim(), (256, 256));
        let (lo, hi) = (0.0, 4.0);
        assert!(up.iter().all(|&v| v >= lo - 1e-5 && v <= hi + 1e-5));
    }

    #[test]
    fn upsample_of_constant_map_is_constant() {
        let map = Array2::from_elem((16, 16), 3.25);
        let up = upsample_bilinear(&map, 256, 256);
        assert!(up.iter().all(|&v| (v - 3.25).abs() < 1e-6));
    }
}
