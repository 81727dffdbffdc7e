mod detector;
mod error;
mod labels;
mod objects;
mod ort_detector;

pub mod config;

pub use detector::{decode_image, Detector};
pub use error::DetectionError;
pub use labels::{load_labels, parse_labels, Labels};
pub use objects::{DetectedObject, Objects};
pub use ort_detector::OrtDetector;
