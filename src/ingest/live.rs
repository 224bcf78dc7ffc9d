//! Live camera source.
//!
//! Each `acquire` call:
//! 1. Probes the feed with a bounded-timeout reachability check
//! 2. Opens the stream, retrying with a fixed backoff
//! 3. Reads one frame, retrying on transient empty reads
//! 4. Decodes and persists the frame under the scratch directory
//!
//! On the first successful capture of the process, and only under the
//! interactive execution model, the frame is shown to a `PreviewGate` so the
//! operator can confirm framing. A cancel at that point drops the frame for
//! this cycle only. Later cycles never preview again.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::FrameSource;
use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::{ExecutionModel, LiveSettings};
use crate::frame::{remove_scratch_file, site_slug, Acquisition, Frame};

/// Transport seam for "fetch one frame from feed X".
pub trait FeedTransport: Send {
    /// Feed identifier for logs.
    fn describe(&self) -> String;

    /// Cheap reachability check. Must return within `timeout`.
    fn probe(&mut self, timeout: Duration) -> Result<()>;

    /// Open the stream.
    fn open(&mut self) -> Result<()>;

    /// Read one encoded frame. `Ok(None)` is a transient empty frame.
    fn read_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Release the stream. Safe to call when not open.
    fn close(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PreviewDecision {
    /// Framing accepted; continue with continuous capture.
    Confirm,
    /// Abort acquisition for this cycle.
    Cancel,
}

/// Operator confirmation of the first live frame.
pub trait PreviewGate: Send {
    fn review(&mut self, frame: &Frame) -> PreviewDecision;
}

pub struct LiveSource {
    site: String,
    settings: LiveSettings,
    execution: ExecutionModel,
    capture_dir: PathBuf,
    transport: Box<dyn FeedTransport>,
    preview: Option<Box<dyn PreviewGate>>,
    previewed: bool,
    cancel: CancelToken,
    clock: Box<dyn Clock>,
    frames_captured: u64,
}

impl LiveSource {
    /// Frames are persisted under `scratch_root/<site slug>`.
    pub fn new(
        site: impl Into<String>,
        settings: LiveSettings,
        execution: ExecutionModel,
        scratch_root: &Path,
        transport: Box<dyn FeedTransport>,
        cancel: CancelToken,
    ) -> Self {
        let site = site.into();
        let capture_dir = scratch_root.join(site_slug(&site));
        Self {
            site,
            settings,
            execution,
            capture_dir,
            transport,
            preview: None,
            previewed: false,
            cancel,
            clock: Box::new(SystemClock),
            frames_captured: 0,
        }
    }

    /// Install the operator preview. Ignored under the single-shot model.
    pub fn with_preview(mut self, gate: Box<dyn PreviewGate>) -> Self {
        self.preview = Some(gate);
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }

    fn empty(&self) -> Acquisition {
        Acquisition::Empty {
            site: self.site.clone(),
        }
    }

    fn open_with_retry(&mut self) -> bool {
        let attempts = self.settings.open_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.open() {
                Ok(()) => return true,
                Err(e) => {
                    log::warn!(
                        "LiveSource: open attempt {}/{} for {} failed: {:#}",
                        attempt,
                        attempts,
                        self.transport.describe(),
                        e
                    );
                }
            }
            if attempt < attempts && !self.cancel.sleep(self.settings.retry_backoff) {
                return false;
            }
        }
        false
    }

    fn read_with_retry(&mut self) -> Option<Vec<u8>> {
        let attempts = self.settings.read_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.read_frame() {
                Ok(Some(bytes)) if !bytes.is_empty() => return Some(bytes),
                Ok(_) => {
                    log::debug!(
                        "LiveSource: empty frame on read {}/{} from {}",
                        attempt,
                        attempts,
                        self.transport.describe()
                    );
                }
                Err(e) => {
                    log::warn!(
                        "LiveSource: read from {} failed: {:#}",
                        self.transport.describe(),
                        e
                    );
                    return None;
                }
            }
            if attempt < attempts && !self.cancel.sleep(self.settings.retry_backoff) {
                return None;
            }
        }
        None
    }

    fn persist(&self, bytes: &[u8], captured_at: DateTime<Utc>) -> Result<PathBuf> {
        let image = image::load_from_memory(bytes).context("decode captured frame")?;
        std::fs::create_dir_all(&self.capture_dir).with_context(|| {
            format!(
                "failed to create capture directory {}",
                self.capture_dir.display()
            )
        })?;
        let path = self.capture_dir.join(format!(
            "screenshot_{}_{}.jpg",
            self.settings.camera_id,
            captured_at.timestamp()
        ));
        image
            .to_rgb8()
            .save(&path)
            .with_context(|| format!("failed to write frame {}", path.display()))?;
        Ok(path)
    }

    fn should_preview(&self) -> bool {
        self.execution == ExecutionModel::Interactive
            && self.settings.preview
            && self.preview.is_some()
            && !self.previewed
    }
}

impl FrameSource for LiveSource {
    fn name(&self) -> &'static str {
        "live"
    }

    fn site(&self) -> &str {
        &self.site
    }

    fn acquire(&mut self) -> Acquisition {
        if let Err(e) = self.transport.probe(self.settings.probe_timeout) {
            log::warn!(
                "LiveSource: {} unreachable: {:#}",
                self.transport.describe(),
                e
            );
            return self.empty();
        }

        if !self.open_with_retry() {
            self.transport.close();
            return self.empty();
        }
        let bytes = self.read_with_retry();
        self.transport.close();

        let Some(bytes) = bytes else {
            return self.empty();
        };

        let captured_at = self.clock.now();
        let path = match self.persist(&bytes, captured_at) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("LiveSource: dropping frame: {:#}", e);
                return self.empty();
            }
        };
        self.frames_captured += 1;
        log::info!("LiveSource: saved {}", path.display());
        let frame = Frame::transient(self.site.clone(), path, captured_at);

        if self.should_preview() {
            self.previewed = true;
            let decision = match self.preview.as_mut() {
                Some(gate) => gate.review(&frame),
                None => PreviewDecision::Confirm,
            };
            if decision == PreviewDecision::Cancel {
                log::info!("LiveSource: preview cancelled; skipping this cycle");
                remove_scratch_file(frame.path());
                return self.empty();
            }
        }

        Acquisition::Frame(frame)
    }
}
