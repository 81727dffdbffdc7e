use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Invalid model output: {0}")]
    InvalidOutput(String),
    #[error("Failed to load labels: {0}")]
    Labels(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Config(String),
}
