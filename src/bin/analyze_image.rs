//! analyze_image - Run the density pipeline once over a local image.
//!
//! Useful for calibrating the density threshold against a camera's field of
//! view without starting the alert loop or touching any transport.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use traffic_sentinel::config::ModelSettings;
use traffic_sentinel::density::validate_threshold;
use traffic_sentinel::frame::remove_scratch_file;
use traffic_sentinel::report::report_from_estimate;
use traffic_sentinel::{BackendKind, DensityEstimator, Detector, Frame, Preprocessor};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Detect vehicles in one image and print its density report"
)]
struct Args {
    /// Image to analyse.
    image: PathBuf,

    /// Site label for the report.
    #[arg(long, default_value = "Avenida dos Estados")]
    site: String,

    /// Density ratio above which traffic is reported as heavy.
    #[arg(long, default_value_t = 0.02)]
    threshold: f64,

    /// Inference backend: `tract` or `stub`.
    #[arg(long, default_value = "tract")]
    backend: BackendKind,

    /// ONNX model weights.
    #[arg(long, env = "TRAFFIC_MODEL_WEIGHTS", default_value = "resources/models/yolov3.onnx")]
    weights: PathBuf,

    /// Class names file, one per line.
    #[arg(long)]
    labels: Option<PathBuf>,

    /// Square network input size.
    #[arg(long, default_value_t = 416)]
    input_size: u32,

    /// Feed the image to the detector as-is.
    #[arg(long, default_value_t = false)]
    skip_preprocess: bool,

    /// Print the report record as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Console output style.
    #[arg(long, value_enum, default_value_t = ui::UiMode::Auto)]
    ui: ui::UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    validate_threshold(args.threshold).context("invalid --threshold")?;
    let ui = ui::Ui::new(
        args.ui,
        std::io::stderr().is_terminal(),
        std::io::stdout().is_terminal(),
    );

    let now = Utc::now();
    let frame = Frame::fixture(args.site.clone(), args.image.clone(), now);

    let artifact = if args.skip_preprocess {
        None
    } else {
        let _stage = ui.stage("Normalize image");
        let preprocessor = Preprocessor::new(std::env::temp_dir().join("traffic_sentinel"));
        Some(
            preprocessor
                .normalize(&frame)
                .with_context(|| format!("failed to normalize {}", args.image.display()))?,
        )
    };
    let input = artifact.as_deref().unwrap_or(frame.path());

    let detector = Detector::from_settings(&ModelSettings {
        backend: args.backend,
        weights: args.weights.clone(),
        labels: args.labels.clone(),
        input_size: args.input_size,
    });
    {
        let _stage = ui.stage("Load detection model");
        detector.warm_up()?;
    }

    let result = {
        let _stage = ui.stage("Detect vehicles");
        detector.detect(input)
    };
    if let Some(path) = &artifact {
        remove_scratch_file(path);
    }
    let result = result?;

    let estimate =
        DensityEstimator::new(args.threshold).estimate(&result, result.frame_width, result.frame_height);
    let report = report_from_estimate(&estimate, &args.site, now);

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        for detection in &result.detections {
            let b = detection.bbox;
            println!(
                "  {:<10} {:.2}  x={} y={} w={} h={}",
                detection.label, detection.confidence, b.x, b.y, b.width, b.height
            );
        }
        println!("{}", report.summary());
    }
    Ok(())
}
