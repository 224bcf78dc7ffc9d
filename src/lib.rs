//! Traffic Sentinel
//!
//! Periodically acquires a roadway image, detects vehicles, estimates how much
//! of the frame they occupy and raises rate-limited traffic alerts.
//!
//! # Module Structure
//!
//! - `ingest`: Frame sources (fixture directory, live HTTP camera feed)
//! - `preprocess`: Contrast equalization and edge-preserving smoothing
//! - `detect`: Inference backends, overlap suppression, the shared `Detector`
//! - `density`: Occupancy ratio and Light/Heavy classification
//! - `report`: Immutable per-cycle report records
//! - `notify`: Audit log and alert transports (MQTT)
//! - `run_loop`: The control loop, throttling and cancellation policy
//! - `config`: Startup configuration from file, environment and flags

pub mod cancel;
pub mod clock;
pub mod config;
pub mod density;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod notify;
pub mod preprocess;
pub mod report;
pub mod run_loop;

pub use cancel::CancelToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, ExecutionModel, Mode, Overrides, RunConfig};
pub use density::{DensityEstimate, DensityEstimator, TrafficCondition};
pub use detect::{BoundingBox, Detection, DetectionResult, Detector, InferenceBackend};
pub use frame::{Acquisition, Frame};
pub use ingest::{FixtureSource, FrameSource, HttpFeed, LiveSource, PreviewDecision, PreviewGate};
pub use notify::{DeliveryOutcome, LogOnlyTransport, Notifier, PublishTransport};
pub use preprocess::Preprocessor;
pub use report::{format_report, CycleReport, DensityReport};
pub use run_loop::{CycleOutcome, NotificationState, RunExit, RunLoop, RunSummary};
