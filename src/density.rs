//! Occupancy estimate from detected vehicle boxes.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detect::DetectionResult;

pub const DEFAULT_DENSITY_THRESHOLD: f64 = 0.02;

/// Thresholds must be finite and non-negative.
pub fn validate_threshold(threshold: f64) -> Result<()> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(anyhow!(
            "density threshold must be a finite, non-negative number (got {})",
            threshold
        ));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficCondition {
    #[serde(rename = "Light traffic")]
    Light,
    #[serde(rename = "Heavy traffic")]
    Heavy,
}

impl TrafficCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "Light traffic",
            Self::Heavy => "Heavy traffic",
        }
    }

    pub fn is_heavy(&self) -> bool {
        matches!(self, Self::Heavy)
    }
}

impl fmt::Display for TrafficCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityEstimate {
    pub vehicle_count: usize,
    /// Summed box area over frame area. Overlapping or out-of-frame boxes can
    /// push this above 1.0; it is not capped.
    pub ratio: f64,
    pub condition: TrafficCondition,
}

#[derive(Clone, Copy, Debug)]
pub struct DensityEstimator {
    threshold: f64,
}

impl Default for DensityEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_DENSITY_THRESHOLD)
    }
}

impl DensityEstimator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Heavy when the ratio is strictly above the threshold.
    pub fn estimate(&self, result: &DetectionResult, width: u32, height: u32) -> DensityEstimate {
        let frame_area = width as f64 * height as f64;
        let covered: i64 = result.boxes().map(|b| b.area()).sum();
        let ratio = if frame_area > 0.0 {
            covered as f64 / frame_area
        } else {
            0.0
        };
        let condition = if ratio > self.threshold {
            TrafficCondition::Heavy
        } else {
            TrafficCondition::Light
        };
        DensityEstimate {
            vehicle_count: result.len(),
            ratio,
            condition,
        }
    }
}
