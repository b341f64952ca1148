#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::DetectionSet;
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Class table of COCO-trained YOLO exports.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Tract-based backend for YOLO-style ONNX object detectors.
///
/// Expects a single output shaped `[1, 4 + classes, anchors]` (or its
/// transpose). Frames are nearest-neighbour resized to the square model input.
/// Labels are reported once each, highest-scoring anchor first.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    confidence_threshold: f32,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        if input_size == 0 {
            return Err(anyhow!("model input size must be > 0"));
        }
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_threshold: 0.5,
            class_names: COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Override the default confidence threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Replace the COCO class table.
    pub fn with_class_names(mut self, class_names: Vec<String>) -> Self {
        self.class_names = class_names;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        if !frame.is_well_formed() {
            return Err(anyhow!(
                "frame {}x{} carries {} bytes, expected packed RGB",
                frame.width,
                frame.height,
                frame.pixels().len()
            ));
        }
        if frame.width == 0 || frame.height == 0 {
            return Err(anyhow!("frame has zero area"));
        }

        let pixels = frame.pixels();
        let side = self.input_size as usize;
        let src_w = frame.width as usize;
        let src_h = frame.height as usize;
        let input =
            tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
                let sx = x * src_w / side;
                let sy = y * src_h / side;
                let idx = (sy * src_w + sx) * BYTES_PER_PIXEL + channel;
                pixels[idx] as f32 / 255.0
            });

        Ok(input.into_tensor())
    }

    fn class_name(&self, class: usize) -> String {
        self.class_names
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class))
    }

    fn decode(&self, outputs: TVec<TValue>) -> Result<DetectionSet> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let scores = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output must have rank 3")?;

        let (batch, rows, cols) = scores.dim();
        if batch != 1 {
            return Err(anyhow!("expected batch size 1, got {}", batch));
        }
        // Anchors outnumber channels in every YOLO export.
        let transposed = rows > cols;
        let (channels, anchors) = if transposed { (cols, rows) } else { (rows, cols) };
        if channels <= 4 {
            return Err(anyhow!("model output has no class channels"));
        }
        let classes = channels - 4;

        let mut hits: Vec<(f32, usize)> = Vec::new();
        for anchor in 0..anchors {
            let mut best: Option<(f32, usize)> = None;
            for class in 0..classes {
                let score = if transposed {
                    scores[[0, anchor, 4 + class]]
                } else {
                    scores[[0, 4 + class, anchor]]
                };
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, class));
                }
            }
            if let Some((score, class)) = best {
                if score.is_finite() && score >= self.confidence_threshold {
                    hits.push((score, class));
                }
            }
        }
        hits.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut set = DetectionSet::new();
        for (_, class) in hits {
            set.insert(self.class_name(class));
        }
        Ok(set)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<DetectionSet> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs)
    }
}
