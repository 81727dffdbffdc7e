use crate::server::AppState;
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use object_detection::{decode_image, DetectionError, Detector, Objects};
use std::time::Instant;
use thiserror::Error;
use tokio::task::{self, JoinError};
use tracing::instrument;

const IMAGE_FIELD: &str = "image";

/// Request body cap for uploads, enough for an uncompressed high resolution photo.
pub const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum PredictImageError {
    #[error("Missing `image` field in multipart form")]
    MissingImage,
    #[error("Invalid multipart payload: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Image decode failed: {0}")]
    Decode(image::ImageError),
    #[error("Detection failed: {0}")]
    Detection(#[from] DetectionError),
    #[error("Detection task failed: {0}")]
    DetectionTask(#[from] JoinError),
}

impl IntoResponse for PredictImageError {
    fn into_response(self) -> Response {
        let status = match &self {
            PredictImageError::MissingImage => StatusCode::UNPROCESSABLE_ENTITY,
            // Oversized bodies surface here as 413.
            PredictImageError::Multipart(err) => err.status(),
            PredictImageError::Decode(_) => StatusCode::BAD_REQUEST,
            PredictImageError::Detection(_) | PredictImageError::DetectionTask(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict_image<D: Detector>(
    State(state): State<AppState<D>>,
    mut multipart: Multipart,
) -> Result<Json<Objects>, PredictImageError> {
    let mut image_data = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            image_data = Some(field.bytes().await?);
            break;
        }
    }
    let image_data = image_data.ok_or(PredictImageError::MissingImage)?;

    let detector = state.detector.clone();
    let started = Instant::now();
    let objects = task::spawn_blocking(move || -> Result<Objects, PredictImageError> {
        let image = decode_image(&image_data).map_err(PredictImageError::Decode)?;
        Ok(detector.predict(&image)?)
    })
    .await??;

    state
        .metrics
        .record_inference_duration(started.elapsed().as_millis() as u64, "rest");
    state.metrics.record_result_sent("rest");
    tracing::debug!("Returning {} detections", objects.objects.len());

    Ok(Json(objects))
}
