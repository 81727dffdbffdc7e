use crate::{error::DetectionError, objects::Objects};
use image::DynamicImage;

/// A loaded object-detection engine.
///
/// Implementations are constructed fully initialised, so a value of this type
/// is always ready to predict. The call is synchronous and may be slow; async
/// callers should run it on a blocking thread.
pub trait Detector: Send + Sync + 'static {
    fn predict(&self, image: &DynamicImage) -> Result<Objects, DetectionError>;
}

/// Decodes an encoded image (JPEG, PNG, ...), guessing the format from its bytes.
pub fn decode_image(image_data: &[u8]) -> Result<DynamicImage, image::ImageError> {
    image::ImageReader::new(std::io::Cursor::new(image_data))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()
}
