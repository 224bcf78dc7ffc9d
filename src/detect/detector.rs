use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::config::{BackendKind, ModelSettings};

use super::backend::{InferenceBackend, RawDetection};
use super::backends::StubBackend;
use super::nms::non_max_suppression;
use super::result::{vehicle_label, BoundingBox, Detection, DetectionResult, VEHICLE_CLASSES};

/// Minimum class score for a candidate row to be considered.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;
/// Score cut applied again inside suppression (exclusive).
pub const NMS_SCORE_THRESHOLD: f32 = 0.5;
pub const NMS_IOU_THRESHOLD: f32 = 0.4;

pub type BackendLoader = Box<dyn Fn() -> Result<Box<dyn InferenceBackend>> + Send + Sync>;

/// Vehicle detector over a lazily loaded network.
///
/// The network is loaded on first use under the lock and then reused. A
/// failed load leaves the slot empty so the next call tries again.
pub struct Detector {
    loader: BackendLoader,
    network: Mutex<Option<Box<dyn InferenceBackend>>>,
}

impl Detector {
    pub fn lazy(loader: BackendLoader) -> Self {
        Self {
            loader,
            network: Mutex::new(None),
        }
    }

    /// Detector over an already constructed backend.
    pub fn with_backend(backend: Box<dyn InferenceBackend>) -> Self {
        Self {
            loader: Box::new(|| Err(anyhow!("detector backend was released"))),
            network: Mutex::new(Some(backend)),
        }
    }

    /// Detector for the configured model.
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let settings = settings.clone();
        Self::lazy(Box::new(move || load_backend(&settings)))
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    /// Load the network now instead of on the first frame.
    pub fn warm_up(&self) -> Result<()> {
        let mut slot = self.lock()?;
        self.ensure_loaded(&mut slot)?;
        Ok(())
    }

    /// Detect vehicles in the image at `path`.
    pub fn detect(&self, path: &Path) -> Result<DetectionResult> {
        let image = image::open(path)
            .with_context(|| format!("failed to read image {}", path.display()))?
            .into_rgb8();
        let (width, height) = image.dimensions();

        let mut slot = self.lock()?;
        let network = self.ensure_loaded(&mut slot)?;
        let rows = network
            .forward(&image)
            .with_context(|| format!("{} forward pass failed", network.name()))?;
        let detections = select_vehicles(&rows, width, height, network.class_names());
        log::debug!(
            "Detector: {} candidate rows, {} vehicles in {}",
            rows.len(),
            detections.len(),
            path.display()
        );

        Ok(DetectionResult {
            detections,
            frame_width: width,
            frame_height: height,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Box<dyn InferenceBackend>>>> {
        self.network
            .lock()
            .map_err(|_| anyhow!("detector lock poisoned"))
    }

    fn ensure_loaded<'a>(
        &self,
        slot: &'a mut MutexGuard<'_, Option<Box<dyn InferenceBackend>>>,
    ) -> Result<&'a mut Box<dyn InferenceBackend>> {
        if slot.is_none() {
            let backend = (self.loader)().context("failed to load detection network")?;
            log::info!(
                "Detector: loaded {} backend (outputs: {})",
                backend.name(),
                backend.output_layers().join(", ")
            );
            **slot = Some(backend);
        }
        (**slot)
            .as_mut()
            .ok_or_else(|| anyhow!("detection network unavailable"))
    }
}

/// Filter rows to vehicle classes, convert to pixel boxes and suppress
/// overlaps.
fn select_vehicles(
    rows: &[RawDetection],
    width: u32,
    height: u32,
    class_names: &[String],
) -> Vec<Detection> {
    let mut candidates = Vec::new();
    for row in rows {
        let Some((class_id, confidence)) = row.best_class() else {
            continue;
        };
        if confidence < CONFIDENCE_THRESHOLD || !VEHICLE_CLASSES.contains(&class_id) {
            continue;
        }
        let center_x = (row.center_x * width as f32) as i32;
        let center_y = (row.center_y * height as f32) as i32;
        let box_w = (row.width * width as f32) as i32;
        let box_h = (row.height * height as f32) as i32;
        candidates.push((
            BoundingBox::new(center_x - box_w / 2, center_y - box_h / 2, box_w, box_h),
            confidence,
            class_id,
        ));
    }

    let boxes: Vec<BoundingBox> = candidates.iter().map(|c| c.0).collect();
    let scores: Vec<f32> = candidates.iter().map(|c| c.1).collect();
    non_max_suppression(&boxes, &scores, NMS_SCORE_THRESHOLD, NMS_IOU_THRESHOLD)
        .into_iter()
        .map(|idx| {
            let (bbox, confidence, class_id) = candidates[idx];
            let label = class_names
                .get(class_id as usize)
                .cloned()
                .unwrap_or_else(|| vehicle_label(class_id).to_string());
            Detection {
                bbox,
                confidence,
                class_id,
                label,
            }
        })
        .collect()
}

/// Build the configured backend. Missing model files are an error.
pub fn load_backend(settings: &ModelSettings) -> Result<Box<dyn InferenceBackend>> {
    match settings.backend {
        BackendKind::Stub => Ok(Box::new(StubBackend::hashed())),
        BackendKind::Tract => {
            if !settings.weights.is_file() {
                return Err(anyhow!(
                    "model weights not found at {}",
                    settings.weights.display()
                ));
            }
            let class_names = match &settings.labels {
                Some(path) => read_class_names(path)?,
                None => Vec::new(),
            };
            load_tract(settings, class_names)
        }
    }
}

/// Read one class name per line, skipping blank lines.
pub fn read_class_names(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read class names from {}", path.display()))?;
    let names: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let needed = VEHICLE_CLASSES.iter().max().copied().unwrap_or(0) as usize + 1;
    if names.len() < needed {
        return Err(anyhow!(
            "class names file {} lists {} classes; need at least {}",
            path.display(),
            names.len(),
            needed
        ));
    }
    Ok(names)
}

#[cfg(feature = "backend-tract")]
fn load_tract(
    settings: &ModelSettings,
    class_names: Vec<String>,
) -> Result<Box<dyn InferenceBackend>> {
    let backend = super::backends::TractBackend::new(&settings.weights, settings.input_size)?
        .with_class_names(class_names);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn load_tract(
    _settings: &ModelSettings,
    _class_names: Vec<String>,
) -> Result<Box<dyn InferenceBackend>> {
    Err(anyhow!(
        "tract backend not compiled in; rebuild with --features backend-tract or use the stub backend"
    ))
}
