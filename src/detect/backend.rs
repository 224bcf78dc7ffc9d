use anyhow::Result;
use image::RgbImage;

/// One candidate row from the network output.
///
/// Geometry is normalized to `0..1` relative to the analysed frame; the
/// confidence of a row is the maximum of its class scores.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub center_x: f32,
    pub center_y: f32,
    pub width: f32,
    pub height: f32,
    pub class_scores: Vec<f32>,
}

impl RawDetection {
    /// Index and value of the best class score.
    pub fn best_class(&self) -> Option<(u32, f32)> {
        self.class_scores
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (idx, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((idx as u32, score)),
            })
    }
}

/// Inference engine seam.
///
/// Backends own the loaded network. They must not retain frames beyond a
/// `forward` call and must not write to disk.
pub trait InferenceBackend: Send {
    fn name(&self) -> &'static str;

    /// Names of the unconnected output layers the network is read from.
    fn output_layers(&self) -> Vec<String>;

    /// Class names indexed by class id; empty when the backend has none.
    fn class_names(&self) -> &[String] {
        &[]
    }

    /// Run one forward pass and return every candidate row.
    fn forward(&mut self, image: &RgbImage) -> Result<Vec<RawDetection>>;
}
