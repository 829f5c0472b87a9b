pub mod cli;
pub mod encode;
pub mod error;
pub mod model;
pub mod postprocess;
pub mod preprocess;
pub mod registry;
pub mod scorer;
pub mod service;
pub mod tensor;

pub use crate::cli::Args;
pub use crate::encode::{to_png_data_uri, ResultRecord};
pub use crate::error::ServiceError;
pub use crate::model::OnnxModel;
pub use crate::postprocess::{normalize_scores, postprocess, render_heatmap, threshold_mask};
pub use crate::preprocess::{decode_image, PreprocessConfig, Processor};
pub use crate::registry::ModelRegistry;
pub use crate::scorer::{AnomalyScorer, EfficientAd};
pub use crate::service::{router, run_batch, AppState, ServiceSettings};
pub use crate::tensor::to_tensor;
