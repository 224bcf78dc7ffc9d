use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

use traffic_sentinel::{CycleOutcome, CycleReport, DeliveryOutcome};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UiMode {
    #[default]
    Auto,
    Plain,
    Pretty,
}

/// Operator console output: startup stage spinners and one line per cycle.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    /// `auto` is pretty only when stderr is a terminal and stdout is not piped.
    pub fn new(mode: UiMode, stderr_is_tty: bool, stdout_is_tty: bool) -> Self {
        let pretty = stderr_is_tty
            && match mode {
                UiMode::Pretty => true,
                UiMode::Auto => stdout_is_tty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }

    /// Echo a finished cycle to stdout.
    #[allow(dead_code)]
    pub fn cycle(&self, outcome: &CycleOutcome) {
        let Some((marker, line)) = describe(outcome) else {
            return;
        };
        if self.pretty {
            println!("{} {}", marker.symbol(), line);
        } else {
            println!("{} {}", marker.tag(), line);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Marker {
    Ok,
    Warn,
    Fail,
    Idle,
}

impl Marker {
    fn symbol(self) -> &'static str {
        match self {
            Marker::Ok => "✔",
            Marker::Warn => "⚠",
            Marker::Fail => "✖",
            Marker::Idle => "·",
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Marker::Ok => "[ok]",
            Marker::Warn => "[warn]",
            Marker::Fail => "[fail]",
            Marker::Idle => "[idle]",
        }
    }
}

fn describe(outcome: &CycleOutcome) -> Option<(Marker, String)> {
    match outcome {
        CycleOutcome::Cancelled => None,
        CycleOutcome::Skipped { site } => Some((Marker::Idle, format!("[{site}] no frame"))),
        CycleOutcome::Throttled { site } => Some((
            Marker::Idle,
            format!("[{site}] reported recently; analysis skipped"),
        )),
        CycleOutcome::PreprocessFailed { site } => {
            Some((Marker::Fail, format!("[{site}] frame could not be normalized")))
        }
        CycleOutcome::Reported {
            site,
            report,
            delivery,
        } => match (report, delivery) {
            (CycleReport::Error(text), _) => Some((Marker::Fail, format!("[{site}] {text}"))),
            (CycleReport::Density(record), Some(DeliveryOutcome::Failed(reason))) => Some((
                Marker::Warn,
                format!("[{site}] {} (notification failed: {reason})", record.summary()),
            )),
            (CycleReport::Density(record), _) => {
                Some((Marker::Ok, format!("[{site}] {}", record.summary())))
            }
        },
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
        }
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        let message = format!("✔ {} ({})", self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
