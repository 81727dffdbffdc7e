use crate::{
    config::{LabelsConfig, ModelConfig, Validatable},
    detector::Detector,
    error::DetectionError,
    labels::Labels,
    objects::{BoundingBox, DetectedObject, Objects},
};
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array, ArrayD, ArrayViewD, Axis, Ix3, Ix4};
use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

fn transform_image(image: &DynamicImage, input_size: u32) -> Array<f32, Ix4> {
    let size = input_size as usize;
    let img = image.resize_exact(input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, size, size));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

#[derive(Debug, Clone, Copy)]
struct PostProcessing {
    min_probability: f32,
    iou_threshold: f32,
    input_size: u32,
}

impl PostProcessing {
    /// Reads a YOLOv8 style `[1, 4 + classes, anchors]` output into boxes
    /// scaled back to the source image.
    fn extract_boxes(
        &self,
        output: ArrayViewD<'_, f32>,
        img_width: u32,
        img_height: u32,
    ) -> Result<Vec<BoundingBox>, DetectionError> {
        let shape = output.shape().to_vec();
        let output = output
            .into_dimensionality::<Ix3>()
            .map_err(|e| DetectionError::InvalidOutput(format!("{:?}: {}", shape, e)))?;
        if shape[0] != 1 || shape[1] <= 4 {
            return Err(DetectionError::InvalidOutput(format!(
                "expected [1, 4 + classes, anchors], got {:?}",
                shape
            )));
        }

        let scale_x = img_width as f32 / self.input_size as f32;
        let scale_y = img_height as f32 / self.input_size as f32;

        let mut boxes = Vec::new();
        for anchor in output.index_axis(Axis(0), 0).axis_iter(Axis(1)) {
            let (class_id, prob) = anchor
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, row| if row.1 > best.1 { row } else { best });

            if prob <= self.min_probability {
                continue;
            }

            let xc = anchor[0] * scale_x;
            let yc = anchor[1] * scale_y;
            let w = anchor[2] * scale_x;
            let h = anchor[3] * scale_y;

            boxes.push(BoundingBox {
                class_id,
                confidence: prob,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        Ok(boxes)
    }
}

/// Class-agnostic non-maximum suppression, highest confidence first.
fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    let mut result = Vec::new();
    while !boxes.is_empty() {
        let best = boxes.remove(0);
        boxes.retain(|candidate| best.iou(candidate) < iou_threshold);
        result.push(best);
    }
    result
}

fn to_objects(boxes: &[BoundingBox], labels: &Labels) -> Objects {
    let objects = boxes
        .iter()
        .map(|bbox| DetectedObject {
            bbox: [
                bbox.x1 as f64,
                bbox.y1 as f64,
                bbox.x2 as f64,
                bbox.y2 as f64,
            ],
            label: labels.get(bbox.class_id),
        })
        .collect();

    Objects { objects }
}

/// YOLOv8 ONNX model served by a small pool of ONNX Runtime sessions.
pub struct OrtDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    labels: Labels,
    postprocessing: PostProcessing,
}

impl OrtDetector {
    pub fn new(
        model_config: &ModelConfig,
        labels_config: &LabelsConfig,
    ) -> Result<Self, DetectionError> {
        model_config.validate().map_err(DetectionError::Config)?;
        labels_config.validate().map_err(DetectionError::Config)?;

        let labels = Labels::load(labels_config)?;
        tracing::info!("Loaded {} class labels", labels.len());

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_execution_providers([TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .build()])?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!("Created {} ONNX sessions", num_instances);

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            labels,
            postprocessing: PostProcessing {
                min_probability: model_config.min_probability,
                iou_threshold: model_config.iou_threshold,
                input_size: model_config.input_size,
            },
        })
    }

    fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, DetectionError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectionError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);
        let tensor_ref = TensorRef::from_array_view(input.view())?;
        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs["output0"].try_extract_tensor::<f32>()?;
        let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectionError::InvalidOutput(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

impl Detector for OrtDetector {
    fn predict(&self, image: &DynamicImage) -> Result<Objects, DetectionError> {
        let (img_width, img_height) = image.dimensions();
        let input = transform_image(image, self.postprocessing.input_size);

        let output = self.run_inference(&input)?;
        let boxes = self
            .postprocessing
            .extract_boxes(output.view(), img_width, img_height)?;
        let boxes = non_max_suppression(boxes, self.postprocessing.iou_threshold);

        for (i, detection) in boxes.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, confidence={:.3}, bbox=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.confidence,
                detection.x1,
                detection.y1,
                detection.x2,
                detection.y2
            );
        }

        Ok(to_objects(&boxes, &self.labels))
    }
}

impl Drop for OrtDetector {
    fn drop(&mut self) {
        tracing::info!("Releasing {} ONNX sessions", self.sessions.len());
    }
}
