use crate::server::AppState;
use axum::{extract::State, http::StatusCode};
use object_detection::Detector;
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<D: Detector>(
    State(state): State<AppState<D>>,
) -> Result<String, (StatusCode, String)> {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
