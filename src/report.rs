//! Per-cycle report records.
//!
//! A `DensityReport` is built once per analysed frame and never mutated. The
//! same value is shown to the operator, written to the audit log and handed to
//! the notifier; nothing downstream re-parses its text form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::clock::iso8601;
use crate::density::{DensityEstimate, TrafficCondition};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DensityReport {
    pub site_name: String,
    pub vehicles_detected: usize,
    pub density: f64,
    pub condition_traffic: TrafficCondition,
    /// Unix seconds.
    pub timestamp: i64,
    pub timestamp_iso: String,
}

impl DensityReport {
    /// "3 vehicles detected with density 0.004883. Condition: Light traffic"
    pub fn summary(&self) -> String {
        format!(
            "{} vehicles detected with density {:.6}. Condition: {}",
            self.vehicles_detected, self.density, self.condition_traffic
        )
    }

    pub fn is_heavy(&self) -> bool {
        self.condition_traffic.is_heavy()
    }
}

impl fmt::Display for DensityReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

pub fn format_report(
    vehicle_count: usize,
    ratio: f64,
    condition: TrafficCondition,
    site: &str,
    at: DateTime<Utc>,
) -> DensityReport {
    DensityReport {
        site_name: site.to_string(),
        vehicles_detected: vehicle_count,
        density: ratio,
        condition_traffic: condition,
        timestamp: at.timestamp(),
        timestamp_iso: iso8601(&at),
    }
}

/// Convenience over `format_report` for an estimator output.
pub fn report_from_estimate(
    estimate: &DensityEstimate,
    site: &str,
    at: DateTime<Utc>,
) -> DensityReport {
    format_report(
        estimate.vehicle_count,
        estimate.ratio,
        estimate.condition,
        site,
        at,
    )
}

/// What a cycle produced: a report, or a failure whose text starts with
/// `Error:`.
#[derive(Clone, Debug, PartialEq)]
pub enum CycleReport {
    Density(DensityReport),
    Error(String),
}

impl CycleReport {
    pub fn error(detail: impl fmt::Display) -> Self {
        Self::Error(format!("Error: {}", detail))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn density(&self) -> Option<&DensityReport> {
        match self {
            Self::Density(report) => Some(report),
            Self::Error(_) => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Self::Density(report) => report.summary(),
            Self::Error(text) => text.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap()
    }

    #[test]
    fn summary_sentence_matches_operator_format() {
        let report = format_report(3, 0.0048828125, TrafficCondition::Light, "Main St", at());
        assert_eq!(
            report.summary(),
            "3 vehicles detected with density 0.004883. Condition: Light traffic"
        );
        assert_eq!(report.timestamp_iso, "2024-03-09T14:05:00Z");
        assert_eq!(report.timestamp, at().timestamp());
    }

    #[test]
    fn record_serializes_with_stable_field_names() {
        let report = format_report(12, 0.031, TrafficCondition::Heavy, "Main St", at());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["site_name"], "Main St");
        assert_eq!(value["vehicles_detected"], 12);
        assert_eq!(value["condition_traffic"], "Heavy traffic");
        assert_eq!(value["timestamp_iso"], "2024-03-09T14:05:00Z");
    }

    #[test]
    fn error_reports_are_prefixed() {
        let report = CycleReport::error("model weights not found");
        assert!(report.is_error());
        assert_eq!(report.text(), "Error: model weights not found");
        assert!(report.density().is_none());
    }
}
