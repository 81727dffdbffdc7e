mod detection_ws;
mod health;
mod index;
mod metrics;
mod predict_image;

use crate::server::AppState;
use axum::{extract::DefaultBodyLimit, routing::get, Router};
use object_detection::Detector;

pub fn api_routes<D: Detector>() -> Router<AppState<D>> {
    Router::new()
        .route("/", get(index::index))
        .route("/assets/script.js", get(index::script))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<D>))
        .route(
            "/object-detection",
            get(detection_ws::object_detection_ws::<D>)
                .post(predict_image::predict_image::<D>)
                .layer(DefaultBodyLimit::max(predict_image::MAX_UPLOAD_BYTES)),
        )
}
