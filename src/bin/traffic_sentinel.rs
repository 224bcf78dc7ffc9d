//! traffic_sentinel - Watch a roadway camera and raise traffic density alerts.
//!
//! Runs the acquisition → normalization → detection → density → alert loop in
//! one of two traffic modes:
//! 1. `demo`: cycles through a directory of fixture images
//! 2. `live`: pulls frames from the configured camera feed
//!
//! Under the interactive execution model the loop runs until Ctrl-C or `q` on
//! the console. Under the single-shot model (`ENVIRONMENT` set to anything but
//! `local`) exactly one cycle runs and the report is printed as JSON.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::{BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use traffic_sentinel::config::{ExecutionModel, Mode, Overrides, RunConfig};
use traffic_sentinel::ingest::{FixtureSource, FrameSource, HttpFeed, LiveSource};
use traffic_sentinel::notify::{AuditLog, LogOnlyTransport, MqttTransport, PublishTransport};
use traffic_sentinel::{
    CancelToken, Detector, Frame, Notifier, Preprocessor, PreviewDecision, PreviewGate, RunLoop,
};

#[path = "../ui.rs"]
mod ui;

const CONSOLE_POLL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Watch a roadway camera and raise traffic density alerts"
)]
struct Args {
    /// Traffic source: `demo` (fixture images) or `live` (camera feed).
    /// Prompted for on a terminal when not configured anywhere.
    mode: Option<String>,

    /// Execution model: `interactive` or `single-shot`.
    #[arg(long)]
    execution: Option<String>,

    /// JSON or TOML config file (takes precedence over TRAFFIC_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip the operator preview of the first live frame.
    #[arg(long, default_value_t = false)]
    no_preview: bool,

    /// Console output style.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto)]
    ui: ui::UiMode,
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let stdin_is_tty = std::io::stdin().is_terminal();
    let ui = ui::Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );

    if let Some(path) = &args.config {
        std::env::set_var("TRAFFIC_CONFIG", path);
    }

    let execution = args
        .execution
        .as_deref()
        .map(str::parse::<ExecutionModel>)
        .transpose()?;
    let mode = match args.mode.as_deref() {
        Some(value) => Some(value.parse::<Mode>()?),
        None => match RunConfig::configured_mode()? {
            Some(mode) => Some(mode),
            None if stdin_is_tty => Some(prompt_mode()?),
            None => None,
        },
    };

    let config = {
        let _stage = ui.stage("Load configuration");
        RunConfig::load(Overrides { mode, execution })?
    };
    log::info!(
        "Site '{}' in {} mode ({}), threshold {}",
        config.site_name,
        config.mode,
        config.execution,
        config.density_threshold
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("Interrupt received; stopping after the current step");
        handler_token.cancel();
    })
    .context("failed to install Ctrl-C handler")?;

    let interactive = config.execution == ExecutionModel::Interactive;
    let mut console_lines = if interactive && stdin_is_tty {
        println!("Type 'q' and press Enter to stop.");
        Some(spawn_console(cancel.clone()))
    } else {
        None
    };

    let source: Box<dyn FrameSource> = match config.mode {
        Mode::Demo => {
            let _stage = ui.stage("Index fixture images");
            Box::new(FixtureSource::new(&config.site_name, &config.fixture_dir)?)
        }
        Mode::Live => {
            let _stage = ui.stage("Prepare camera feed");
            let feed = HttpFeed::new(&config.live.url, config.live.probe_timeout)?;
            let mut settings = config.live.clone();
            if args.no_preview {
                settings.preview = false;
            }
            let mut source = LiveSource::new(
                &config.site_name,
                settings,
                config.execution,
                config.scratch_root(),
                Box::new(feed),
                cancel.clone(),
            );
            if let Some(lines) = console_lines.take() {
                source = source.with_preview(Box::new(ConsolePreview {
                    lines,
                    cancel: cancel.clone(),
                }));
            }
            Box::new(source)
        }
    };

    let detector = Detector::from_settings(&config.model);
    if interactive {
        let _stage = ui.stage("Load detection model");
        if let Err(e) = detector.warm_up() {
            log::warn!("Detection model not loaded yet: {:#}", e);
        }
    }

    let transport: Box<dyn PublishTransport> = match &config.notify.mqtt {
        Some(mqtt) => {
            let _stage = ui.stage("Connect to MQTT broker");
            Box::new(MqttTransport::connect(mqtt)?)
        }
        None => {
            log::info!("No alert transport configured; alerts go to the audit log only");
            Box::new(LogOnlyTransport)
        }
    };
    let notifier = Notifier::new(
        config.notify.channel.clone(),
        transport,
        AuditLog::new(config.audit_log_path()),
    );

    let preprocessor = Preprocessor::new(config.scratch_root().join("filtered"));
    let cycle_ui = ui.clone();
    let mut run_loop = RunLoop::new(&config, source, preprocessor, detector, notifier, cancel)
        .with_observer(Box::new(move |outcome| cycle_ui.cycle(outcome)));
    let summary = run_loop.run();

    if !interactive {
        if let Some(report) = &summary.last_report {
            println!(
                "{}",
                serde_json::to_string_pretty(report).context("serialize report")?
            );
        }
    }

    if summary.exit.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        log::error!("Run ended without a frame ({:?})", summary.exit);
        Ok(ExitCode::FAILURE)
    }
}

fn prompt_mode() -> Result<Mode> {
    print!("Select mode (demo/live): ");
    std::io::stdout().flush().context("flush prompt")?;
    let mut line = String::new();
    let read = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read mode from stdin")?;
    if read == 0 {
        return Err(anyhow!("no mode selected: stdin closed"));
    }
    line.parse()
}

/// Forward console lines to the preview gate; `q` or `quit` cancels the run.
fn spawn_console(cancel: CancelToken) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if matches!(line.trim(), "q" | "quit") {
                log::info!("Stop requested from console");
                cancel.cancel();
                break;
            }
            let _ = tx.send(line);
        }
    });
    rx
}

struct ConsolePreview {
    lines: Receiver<String>,
    cancel: CancelToken,
}

impl PreviewGate for ConsolePreview {
    fn review(&mut self, frame: &Frame) -> PreviewDecision {
        println!("Preview frame saved to {}", frame.path.display());
        println!("Press Enter to start continuous capture, or type 'c' to skip this capture.");
        loop {
            if self.cancel.is_cancelled() {
                return PreviewDecision::Cancel;
            }
            match self.lines.recv_timeout(CONSOLE_POLL) {
                Ok(line) => {
                    return match line.trim().to_lowercase().as_str() {
                        "c" | "cancel" => PreviewDecision::Cancel,
                        _ => PreviewDecision::Confirm,
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return PreviewDecision::Confirm,
            }
        }
    }
}
