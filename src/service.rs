use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::DynamicImage;
use ndarray::Array3;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::encode::{
    grid_to_image, to_png_data_uri, ResultRecord, PLACEHOLDER_F1, PLACEHOLDER_IOU,
};
use crate::error::ServiceError;
use crate::postprocess::postprocess;
use crate::preprocess::{decode_image, Processor};
use crate::registry::ModelRegistry;
use crate::scorer::AnomalyScorer;
use crate::tensor::to_tensor;

/// Request-handling knobs that come from the CLI.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Cutoff applied to normalized anomaly scores.
    pub threshold: f32,
    /// Attach the preprocessed input image to each record.
    pub include_processed: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub processor: Arc<Processor>,
    pub settings: ServiceSettings,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::UnknownModel(_) | ServiceError::Decode(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/predict", post(predict))
        // Uploads are photographs; axum's 2 MB default is far too small.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "Wood Anomaly Detection API is running" }))
}

/// `POST /predict`: multipart upload with repeated `files` parts and a
/// `modelName` text field. Returns one record per successfully decoded
/// file, in upload order.
async fn predict(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<ResultRecord>>, ServiceError> {
    let mut model_name = String::new();
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServiceError::Decode(format!("multipart: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "modelName" => {
                model_name = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::Decode(format!("model name field: {e}")))?;
            }
            "files" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::Decode(format!("read upload: {e}")))?;
                files.push((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(ServiceError::Decode("no files uploaded".into()));
    }

    let scorer = state.registry.resolve(&model_name)?;
    let records = run_batch(
        &files,
        &model_name,
        scorer.as_ref(),
        &state.processor,
        &state.settings,
    )?;
    Ok(Json(records))
}

/// Process one upload batch.
///
/// Decode + preprocess fan out across the batch; scoring and encoding run
/// sequentially. Files that fail to decode are logged and skipped, the rest
/// of the batch is unaffected, and the output order matches the upload
/// order.
pub fn run_batch(
    files: &[(String, Vec<u8>)],
    model_name: &str,
    scorer: &dyn AnomalyScorer,
    processor: &Processor,
    settings: &ServiceSettings,
) -> Result<Vec<ResultRecord>, ServiceError> {
    let grids: Vec<Option<(&str, Array3<f32>)>> = files
        .par_iter()
        .map(|(filename, bytes)| {
            match decode_image(bytes).and_then(|img| processor.preprocess(&img)) {
                Ok(grid) => Some((filename.as_str(), grid)),
                Err(err) => {
                    warn!(file = %filename, %err, "skipping file");
                    None
                }
            }
        })
        .collect();

    let mut records = Vec::new();
    for (filename, grid) in grids.into_iter().flatten() {
        let tensor = to_tensor(&grid, scorer.standardized_input());
        let scores = scorer.score(&tensor)?;
        let (mask, heatmap) = postprocess(&scores, settings.threshold);

        let processed = if settings.include_processed {
            Some(to_png_data_uri(&DynamicImage::ImageRgb8(grid_to_image(
                &grid,
            )))?)
        } else {
            None
        };

        records.push(ResultRecord {
            filename: filename.to_string(),
            model: model_name.to_string(),
            f1_score: PLACEHOLDER_F1,
            iou: PLACEHOLDER_IOU,
            mask: to_png_data_uri(&DynamicImage::ImageLuma8(mask))?,
            heatmap: to_png_data_uri(&DynamicImage::ImageRgb8(heatmap))?,
            processed,
        });
    }
    Ok(records)
}
