//! Frame acquisition sources.
//!
//! This module provides the two sources a run can be driven by:
//! - `FixtureSource`: replays a fixed directory of sample images (demo mode)
//! - `LiveSource`: pulls one frame per call from a remote camera feed (live mode)
//!
//! Both implement `FrameSource`. A source never fails the caller: when no frame
//! can be obtained it returns `Acquisition::Empty` and the run loop skips the
//! cycle.
//!
//! The live source talks to the camera through the `FeedTransport` seam; the
//! HTTP implementation lives in `http`.

pub mod fixture;
pub mod http;
pub mod live;

pub use fixture::FixtureSource;
pub use http::HttpFeed;
pub use live::{FeedTransport, LiveSource, PreviewDecision, PreviewGate};

use crate::frame::Acquisition;

/// A producer of labeled frames.
pub trait FrameSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &'static str;

    /// Site label attached to every frame this source produces.
    fn site(&self) -> &str;

    /// Acquire the next frame, or `Empty` when none is obtainable.
    fn acquire(&mut self) -> Acquisition;
}
