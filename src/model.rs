use std::path::Path;

use ort::ep::{CPU, CUDA};
use ort::session::builder::SessionBuilder;
use tracing::info;

use crate::error::ServiceError;

/// ONNX session factory with a fixed execution-provider choice.
pub struct OnnxModel {
    provider: [ort::ep::ExecutionProviderDispatch; 1],
}

impl OnnxModel {
    pub fn new(cuda: bool) -> Self {
        let provider = if cuda {
            [CUDA::default().build().error_on_failure()]
        } else {
            [CPU::default().build()]
        };
        Self { provider }
    }

    /// Load serialized weights into a ready-to-run session.
    pub fn load_model(&self, model_path: &Path) -> Result<ort::session::Session, ServiceError> {
        let build = || -> Result<ort::session::Session, ort::Error> {
            SessionBuilder::new()?
                .with_execution_providers(self.provider.clone())?
                .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
                .commit_from_file(model_path)
        };
        let session = build().map_err(|source| ServiceError::ModelLoad {
            path: model_path.to_path_buf(),
            source,
        })?;
        info!(path = %model_path.display(), "loaded model weights");
        Ok(session)
    }
}
