//! The sensing-and-alerting control loop.
//!
//! One cycle is: acquire a frame, decide whether this cycle analyses it,
//! normalize and detect, build a report, notify when the report is not an
//! error, then remove scratch files. Under the interactive model cycles repeat
//! until cancelled; under the single-shot model exactly one cycle runs.
//!
//! Failures inside a cycle never end the loop. Only two conditions end a run
//! early: cancellation, and an interactive demo run whose fixture source is
//! empty on the first cycle.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{ExecutionModel, Mode, RunConfig};
use crate::density::DensityEstimator;
use crate::detect::Detector;
use crate::frame::{remove_scratch_file, Acquisition, Frame};
use crate::ingest::FrameSource;
use crate::notify::{DeliveryOutcome, Notifier};
use crate::preprocess::Preprocessor;
use crate::report::{report_from_estimate, CycleReport, DensityReport};

/// Last successful delivery per site. Sites never delivered to are due.
#[derive(Clone, Debug, Default)]
pub struct NotificationState {
    last_sent: HashMap<String, DateTime<Utc>>,
}

impl NotificationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_sent(&self, site: &str) -> Option<DateTime<Utc>> {
        self.last_sent.get(site).copied()
    }

    /// True when at least `throttle` has passed since the last delivery.
    pub fn is_due(&self, site: &str, now: DateTime<Utc>, throttle: Duration) -> bool {
        match self.last_sent.get(site) {
            None => true,
            Some(last) => match (now - *last).to_std() {
                Ok(elapsed) => elapsed >= throttle,
                // clock moved backwards
                Err(_) => false,
            },
        }
    }

    pub fn record_delivery(&mut self, site: &str, at: DateTime<Utc>) {
        self.last_sent.insert(site.to_string(), at);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CycleOutcome {
    Cancelled,
    /// The source had no frame.
    Skipped { site: String },
    /// A frame was captured but the throttle window had not elapsed.
    Throttled { site: String },
    /// The frame could not be normalized; no report.
    PreprocessFailed { site: String },
    Reported {
        site: String,
        report: CycleReport,
        /// `None` when the report was an error and nothing was sent.
        delivery: Option<DeliveryOutcome>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    Cancelled,
    /// The single-shot cycle ran.
    Completed,
    /// Interactive demo found no fixtures on the first cycle.
    FixturesExhausted,
    /// Single-shot cycle obtained no frame.
    NoFrame,
}

impl RunExit {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::NoFrame)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub skipped: u64,
    pub throttled: u64,
    pub reports: u64,
    pub error_reports: u64,
    pub notifications: u64,
    pub failed_notifications: u64,
}

#[derive(Clone, Debug)]
pub struct RunSummary {
    pub exit: RunExit,
    pub stats: RunStats,
    pub last_report: Option<DensityReport>,
}

/// Called with every finished cycle, e.g. to echo results to a console.
pub type CycleObserver = Box<dyn FnMut(&CycleOutcome) + Send>;

pub struct RunLoop {
    mode: Mode,
    execution: ExecutionModel,
    capture_interval: Duration,
    report_throttle: Duration,
    empty_retry: Duration,
    source: Box<dyn FrameSource>,
    preprocessor: Preprocessor,
    detector: Detector,
    estimator: DensityEstimator,
    notifier: Notifier,
    state: NotificationState,
    clock: Box<dyn Clock>,
    cancel: CancelToken,
    stats: RunStats,
    last_report: Option<DensityReport>,
    observer: Option<CycleObserver>,
}

impl RunLoop {
    pub fn new(
        config: &RunConfig,
        source: Box<dyn FrameSource>,
        preprocessor: Preprocessor,
        detector: Detector,
        notifier: Notifier,
        cancel: CancelToken,
    ) -> Self {
        Self {
            mode: config.mode,
            execution: config.execution,
            capture_interval: config.capture_interval,
            report_throttle: config.report_throttle,
            empty_retry: config.empty_retry,
            source,
            preprocessor,
            detector,
            estimator: DensityEstimator::new(config.density_threshold),
            notifier,
            state: NotificationState::new(),
            clock: Box::new(SystemClock),
            cancel,
            stats: RunStats::default(),
            last_report: None,
            observer: None,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_observer(mut self, observer: CycleObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn notification_state(&self) -> &NotificationState {
        &self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Drive cycles until the execution model says stop.
    pub fn run(&mut self) -> RunSummary {
        log::info!(
            "RunLoop: starting {} mode ({}) on {} source for '{}'",
            self.mode,
            self.execution,
            self.source.name(),
            self.source.site()
        );
        let exit = match self.execution {
            ExecutionModel::Interactive => self.run_interactive(),
            ExecutionModel::SingleShot => self.run_single_shot(),
        };
        self.notifier.close();
        log::info!(
            "RunLoop: finished ({:?}) after {} cycle(s), {} report(s), {} notification(s)",
            exit,
            self.stats.cycles,
            self.stats.reports,
            self.stats.notifications
        );
        RunSummary {
            exit,
            stats: self.stats.clone(),
            last_report: self.last_report.clone(),
        }
    }

    fn run_interactive(&mut self) -> RunExit {
        let mut first_cycle = true;
        loop {
            if self.cancel.is_cancelled() {
                return RunExit::Cancelled;
            }
            let outcome = self.run_cycle();
            self.observe(&outcome);
            let was_first = std::mem::replace(&mut first_cycle, false);
            let pause = match outcome {
                CycleOutcome::Cancelled => return RunExit::Cancelled,
                CycleOutcome::Skipped { site } => {
                    if was_first && self.mode == Mode::Demo {
                        log::warn!(
                            "RunLoop: no fixtures available for '{}'; stopping demo",
                            site
                        );
                        return RunExit::FixturesExhausted;
                    }
                    self.empty_retry
                }
                _ => self.capture_interval,
            };
            if !self.cancel.sleep(pause) {
                return RunExit::Cancelled;
            }
        }
    }

    fn run_single_shot(&mut self) -> RunExit {
        let outcome = self.run_cycle();
        self.observe(&outcome);
        match outcome {
            CycleOutcome::Cancelled => RunExit::Cancelled,
            CycleOutcome::Skipped { site } => {
                log::error!("RunLoop: no frame obtained for '{}'", site);
                RunExit::NoFrame
            }
            _ => RunExit::Completed,
        }
    }

    /// Run one full cycle, including cleanup.
    pub fn run_cycle(&mut self) -> CycleOutcome {
        if self.cancel.is_cancelled() {
            return CycleOutcome::Cancelled;
        }
        self.stats.cycles += 1;

        let frame = match self.source.acquire() {
            Acquisition::Frame(frame) => frame,
            Acquisition::Empty { site } => {
                log::warn!(
                    "RunLoop: {} source returned no frame for '{}'; skipping cycle",
                    self.source.name(),
                    site
                );
                self.stats.skipped += 1;
                return CycleOutcome::Skipped { site };
            }
        };

        let now = self.clock.now();
        let outcome = if self.should_report(&frame.site, now) {
            self.analyze(&frame, now)
        } else {
            log::info!(
                "RunLoop: '{}' reported less than {}s ago; skipping analysis",
                frame.site,
                self.report_throttle.as_secs()
            );
            self.stats.throttled += 1;
            CycleOutcome::Throttled {
                site: frame.site.clone(),
            }
        };

        if frame.is_transient() {
            remove_scratch_file(frame.path());
        }
        outcome
    }

    fn observe(&mut self, outcome: &CycleOutcome) {
        if let Some(observer) = self.observer.as_mut() {
            observer(outcome);
        }
    }

    fn should_report(&self, site: &str, now: DateTime<Utc>) -> bool {
        match self.mode {
            Mode::Demo => true,
            Mode::Live => self.state.is_due(site, now, self.report_throttle),
        }
    }

    fn analyze(&mut self, frame: &Frame, now: DateTime<Utc>) -> CycleOutcome {
        let site = frame.site.clone();
        let Some(artifact) = self.preprocessor.normalize(frame) else {
            return CycleOutcome::PreprocessFailed { site };
        };

        let report = match self.detector.detect(&artifact) {
            Ok(result) => {
                let estimate =
                    self.estimator
                        .estimate(&result, result.frame_width, result.frame_height);
                CycleReport::Density(report_from_estimate(&estimate, &site, now))
            }
            Err(e) => CycleReport::error(format!("{:#}", e)),
        };
        remove_scratch_file(&artifact);
        self.stats.reports += 1;

        let delivery = match &report {
            CycleReport::Density(record) => {
                log::info!("[{}] {}", site, record.summary());
                let outcome = self.notifier.deliver(record, now);
                if outcome.is_delivered() {
                    self.state.record_delivery(&site, now);
                    self.stats.notifications += 1;
                } else {
                    self.stats.failed_notifications += 1;
                }
                self.last_report = Some(record.clone());
                Some(outcome)
            }
            CycleReport::Error(text) => {
                log::error!("[{}] {}", site, text);
                self.stats.error_reports += 1;
                None
            }
        };

        CycleOutcome::Reported {
            site,
            report,
            delivery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn unknown_site_is_due() {
        let state = NotificationState::new();
        assert!(state.is_due("Main St", t0(), Duration::from_secs(36)));
        assert_eq!(state.last_sent("Main St"), None);
    }

    #[test]
    fn throttle_window_is_inclusive_at_boundary() {
        let mut state = NotificationState::new();
        let throttle = Duration::from_secs(36);
        state.record_delivery("Main St", t0());
        assert!(!state.is_due("Main St", t0() + chrono::Duration::seconds(35), throttle));
        assert!(state.is_due("Main St", t0() + chrono::Duration::seconds(36), throttle));
        assert!(state.is_due("Other Rd", t0(), throttle));
    }

    #[test]
    fn clock_going_backwards_is_not_due() {
        let mut state = NotificationState::new();
        state.record_delivery("Main St", t0());
        assert!(!state.is_due(
            "Main St",
            t0() - chrono::Duration::seconds(5),
            Duration::ZERO
        ));
    }

    #[test]
    fn only_no_frame_exit_is_failure() {
        assert!(RunExit::Cancelled.is_success());
        assert!(RunExit::Completed.is_success());
        assert!(RunExit::FixturesExhausted.is_success());
        assert!(!RunExit::NoFrame.is_success());
    }
}
