#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::{imageops, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{non_max_suppression, Detection, ObjectClass};

const NMS_IOU_THRESHOLD: f32 = 0.45;

/// Tract-based backend for YOLO-family ONNX detectors.
///
/// Expects the exported YOLOv8 layout: one output of shape `[1, 4 + classes, anchors]`
/// with boxes as centre x, centre y, width, height in model input pixels.
/// The image is resized to the model input and boxes are scaled back.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    width: u32,
    height: u32,
    confidence_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        log::info!(
            "loaded ONNX detector {} ({}x{})",
            model_path.display(),
            width,
            height
        );
        Ok(Self {
            model,
            width,
            height,
            confidence_threshold: 0.25,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = imageops::resize(image, self.width, self.height, imageops::FilterType::Triangle);
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, scale_x: f32, scale_y: f32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] <= 4 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let (channels, anchors) = (shape[1], shape[2]);

        let mut detections = Vec::new();
        for anchor in 0..anchors {
            let (class_id, score) = (4..channels)
                .map(|c| (c - 4, view[[0, c, anchor]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if !score.is_finite() || score < self.confidence_threshold {
                continue;
            }
            let cx = view[[0, 0, anchor]] * scale_x;
            let cy = view[[0, 1, anchor]] * scale_y;
            let w = view[[0, 2, anchor]] * scale_x;
            let h = view[[0, 3, anchor]] * scale_y;
            detections.push(Detection::new(
                [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                score,
                ObjectClass::from_coco_id(class_id),
            ));
        }
        Ok(non_max_suppression(detections, NMS_IOU_THRESHOLD))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow!("cannot run detection on an empty image"));
        }
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let scale_x = image.width() as f32 / self.width as f32;
        let scale_y = image.height() as f32 / self.height as f32;
        self.decode(outputs, scale_x, scale_y)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.detect(&RgbImage::new(self.width, self.height)).map(|_| ())
    }
}
