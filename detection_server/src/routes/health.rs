use axum::response::Json;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    version: String,
}

pub async fn healthcheck() -> Json<Status> {
    Json(Status {
        status: "Available".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
