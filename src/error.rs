use std::path::PathBuf;

use thiserror::Error;

/// Error taxonomy for the anomaly detection service.
///
/// Per-file failures (`Decode`) are isolated: the file is skipped and the
/// rest of the batch is processed. Per-request failures (`UnknownModel`)
/// abort the request with a client error. Everything else is a server-side
/// failure on the affected request.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Requested model name is not registered.
    #[error("model '{0}' is not registered")]
    UnknownModel(String),

    /// Uploaded bytes could not be parsed as an image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// A preprocessing stage could not produce a usable grid.
    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    /// A result artifact could not be encoded for the response.
    #[error("failed to encode image artifact: {0}")]
    Encode(String),

    /// Model weights could not be loaded from disk.
    #[error("failed to load model weights from {path:?}: {source}")]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    /// The model ran but produced unusable output, or the run itself failed.
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<image::ImageError> for ServiceError {
    fn from(err: image::ImageError) -> Self {
        ServiceError::Decode(err.to_string())
    }
}

impl From<ort::Error> for ServiceError {
    fn from(err: ort::Error) -> Self {
        ServiceError::Inference(err.to_string())
    }
}
