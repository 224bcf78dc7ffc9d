//! Frame normalization ahead of detection.
//!
//! `Preprocessor::normalize` loads the captured frame, equalizes contrast on
//! the luminance channel, applies edge-preserving smoothing and writes the
//! result as a new PNG artifact. It never deletes the source frame.

pub mod filters;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::frame::{site_slug, Frame};
pub use filters::{bilateral_smooth, equalize_luminance, FilterParams};

pub struct Preprocessor {
    output_dir: PathBuf,
    params: FilterParams,
}

impl Preprocessor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            params: FilterParams::default(),
        }
    }

    pub fn with_params(mut self, params: FilterParams) -> Self {
        self.params = params;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Normalize `frame` into `filtered_image_<site>_<epoch>.png`.
    ///
    /// Returns `None` (after logging) when the frame cannot be read or the
    /// artifact cannot be written.
    pub fn normalize(&self, frame: &Frame) -> Option<PathBuf> {
        match self.try_normalize(frame) {
            Ok(path) => {
                log::debug!("Preprocessor: wrote {}", path.display());
                Some(path)
            }
            Err(e) => {
                log::warn!(
                    "Preprocessor: skipping {} for '{}': {:#}",
                    frame.path.display(),
                    frame.site,
                    e
                );
                None
            }
        }
    }

    fn try_normalize(&self, frame: &Frame) -> Result<PathBuf> {
        let source = image::open(&frame.path)
            .with_context(|| format!("failed to load frame {}", frame.path.display()))?
            .into_rgb8();

        let equalized = equalize_luminance(&source, self.params.clip_limit);
        let smoothed = bilateral_smooth(&equalized, &self.params);

        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!(
                "failed to create artifact directory {}",
                self.output_dir.display()
            )
        })?;
        let path = self.output_dir.join(format!(
            "filtered_image_{}_{}.png",
            site_slug(&frame.site),
            frame.captured_at.timestamp()
        ));
        smoothed
            .save(&path)
            .with_context(|| format!("failed to write artifact {}", path.display()))?;
        Ok(path)
    }
}
