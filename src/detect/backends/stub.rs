use anyhow::Result;
use image::RgbImage;
use sha2::{Digest, Sha256};

use crate::detect::backend::{InferenceBackend, RawDetection};
use crate::detect::result::VEHICLE_CLASSES;

const COCO_CLASS_COUNT: usize = 80;

/// Backend without a network.
///
/// `hashed` derives a stable set of vehicle rows from the SHA-256 of the frame
/// pixels, so the same image always yields the same detections. `scripted`
/// replays fixed rows on every call.
pub struct StubBackend {
    mode: StubMode,
    calls: u64,
}

enum StubMode {
    Hashed,
    Scripted(Vec<RawDetection>),
}

impl StubBackend {
    pub fn hashed() -> Self {
        Self {
            mode: StubMode::Hashed,
            calls: 0,
        }
    }

    pub fn scripted(rows: Vec<RawDetection>) -> Self {
        Self {
            mode: StubMode::Scripted(rows),
            calls: 0,
        }
    }

    /// Number of forward passes served.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::hashed()
    }
}

impl InferenceBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn output_layers(&self) -> Vec<String> {
        vec!["stub_out".to_string()]
    }

    fn forward(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>> {
        self.calls += 1;
        match &self.mode {
            StubMode::Scripted(rows) => Ok(rows.clone()),
            StubMode::Hashed => Ok(rows_from_digest(&Sha256::digest(image.as_raw()))),
        }
    }
}

fn rows_from_digest(digest: &[u8]) -> Vec<RawDetection> {
    let count = (digest[0] % 6) as usize;
    digest[1..]
        .chunks_exact(5)
        .take(count)
        .map(|chunk| {
            let unit = |b: u8| b as f32 / 255.0;
            let mut class_scores = vec![0.0; COCO_CLASS_COUNT];
            let class = VEHICLE_CLASSES[(chunk[4] % VEHICLE_CLASSES.len() as u8) as usize];
            class_scores[class as usize] = 0.6 + 0.39 * unit(chunk[4]);
            RawDetection {
                center_x: 0.1 + 0.8 * unit(chunk[0]),
                center_y: 0.1 + 0.8 * unit(chunk[1]),
                width: 0.04 + 0.16 * unit(chunk[2]),
                height: 0.04 + 0.16 * unit(chunk[3]),
                class_scores,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn hashed_output_is_stable_per_image() {
        let mut backend = StubBackend::hashed();
        let a = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let b = RgbImage::from_pixel(8, 8, Rgb([9, 9, 9]));
        let first = backend.forward(&a).unwrap();
        assert_eq!(backend.forward(&a).unwrap(), first);
        assert!(first.len() < 6);
        for row in &first {
            let (class, score) = row.best_class().unwrap();
            assert!(VEHICLE_CLASSES.contains(&class));
            assert!(score >= 0.6);
        }
        backend.forward(&b).unwrap();
        assert_eq!(backend.calls(), 3);
    }

    #[test]
    fn scripted_rows_are_replayed() {
        let row = RawDetection {
            center_x: 0.5,
            center_y: 0.5,
            width: 0.2,
            height: 0.2,
            class_scores: vec![0.0, 0.0, 0.9],
        };
        let mut backend = StubBackend::scripted(vec![row.clone()]);
        let img = RgbImage::new(4, 4);
        assert_eq!(backend.forward(&img).unwrap(), vec![row]);
    }
}
