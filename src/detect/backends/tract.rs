#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceBackend, RawDetection};

/// Leading columns of a YOLO output row before the class scores:
/// center x, center y, width, height, objectness.
const ROW_PREFIX: usize = 5;

/// Tract-based backend for YOLO-style ONNX models.
///
/// Frames are stretched to a square `input_size` blob, scaled to `0..1` and
/// fed as NCHW RGB. Every output tensor is read as rows of
/// `[cx, cy, w, h, objectness, class scores...]`.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    output_layers: Vec<String>,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let graph = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?;
        let output_layers = graph
            .output_outlets()
            .context("failed to resolve model outputs")?
            .iter()
            .map(|outlet| graph.node(outlet.node).name.clone())
            .collect();
        let side = input_size as usize;
        let model = graph
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
            output_layers,
            class_names: Vec::new(),
        })
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = names;
        self
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let side = self.input_size;
        let resized = image::imageops::resize(image, side, side, FilterType::Triangle);
        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        input.into_tensor()
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn output_layers(&self) -> Vec<String> {
        self.output_layers.clone()
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn forward(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;

        let mut rows = Vec::new();
        for output in outputs.iter() {
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            let row_len = *view
                .shape()
                .last()
                .ok_or_else(|| anyhow!("model output has no dimensions"))?;
            if row_len <= ROW_PREFIX {
                return Err(anyhow!(
                    "model output rows have {} columns; expected more than {}",
                    row_len,
                    ROW_PREFIX
                ));
            }
            let values: Vec<f32> = view.iter().copied().collect();
            rows.extend(values.chunks_exact(row_len).map(|row| RawDetection {
                center_x: row[0],
                center_y: row[1],
                width: row[2],
                height: row[3],
                class_scores: row[ROW_PREFIX..].to_vec(),
            }));
        }
        Ok(rows)
    }
}
