//! Speedwatch: speed-violation detection for fixed traffic cameras.
//!
//! Frames flow through a per-frame stage graph:
//!
//! 1. **Detect**: a `Detector` yields tracked vehicles.
//! 2. **Speed**: a `SpeedEstimator` rectifies each track's anchor point through
//!    a `ViewTransformer` homography and measures displacement over a one-second
//!    sliding window.
//! 3. **Check**: tracks strictly above the speed limit become violations.
//! 4. **Plate**: the plate region is cropped and recognized, either inline or
//!    through the bounded `OffloadQueue`.
//! 5. **Save / Report**: the first violation per plate is persisted through a
//!    `ViolationSink` and explained by a `ReportGenerator`.
//!
//! In split mode step 5 runs once, after the offload queue has been drained.
//!
//! # Module Structure
//!
//! - `transform`: pixel to reference-plane homography
//! - `speed`: sliding-window speed estimation
//! - `offload`: plate-recognition worker pool with a drain barrier
//! - `pipeline`: stage graph, runner and accumulated run state
//! - `detect`, `plate`, `storage`, `report`: collaborator traits and local implementations
//! - `ingest`: frame sources
//! - `config`: file and environment configuration
//! - `remote` (feature `remote`): HTTP model collaborators

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod offload;
pub mod pipeline;
pub mod plate;
#[cfg(feature = "remote")]
pub mod remote;
pub mod report;
pub mod speed;
pub mod storage;
pub mod transform;

pub use config::SpeedwatchConfig;
pub use detect::{Detector, ObjectClass, ReplayDetector, TrackedObject};
pub use frame::{BoundingBox, Frame, PixelRect, PlateImage};
pub use ingest::{FileConfig, FileSource, FrameSource};
pub use offload::{
    DrainedResults, OffloadConfig, OffloadQueue, OffloadStats, PlateResult, PlateTask,
    SubmitOutcome,
};
pub use pipeline::{
    AccumulatedState, Collaborators, Diagnostic, FailureKind, FrameReport, PipelineConfig,
    PipelineMode, PlateMode, RunSummary, SavedViolation, Stage, Violation, ViolationPipeline,
};
pub use plate::{PlateCropConfig, PlateRecognizer};
pub use report::{
    ReportGenerator, ReportRequest, StaticVehicleLookup, TemplateReportGenerator, VehicleInfo,
    VehicleLookup,
};
pub use speed::{SpeedEstimate, SpeedEstimator, SpeedSettings};
pub use storage::{InMemoryViolationStore, SqliteViolationStore, ViolationRecord, ViolationSink};
pub use transform::{reference_rectangle, Quad, ViewTransformer};

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
