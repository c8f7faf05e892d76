use std::collections::BTreeMap;

use serde::Serialize;

use crate::detect::TrackedObject;
use crate::frame::Frame;
use crate::offload::PlateResult;
use crate::speed::SpeedEstimate;
use crate::storage::ViolationRecord;

use super::stage::{Directive, Stage};

/// A track observed above the speed limit in one frame.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Violation {
    pub tracker_id: u64,
    pub frame_id: u64,
    pub speed: f64,
    pub speed_limit: f64,
    pub exceed_speed: f64,
    pub camera_id: String,
    pub location: String,
    pub timestamp: f64,
}

impl Violation {
    pub fn to_record(&self, plate_number: &str) -> ViolationRecord {
        ViolationRecord {
            plate_number: plate_number.to_string(),
            speed: self.speed,
            speed_limit: self.speed_limit,
            exceed_speed: self.exceed_speed,
            location: self.location.clone(),
            timestamp: self.timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SavedViolation {
    pub id: i64,
    pub frame_id: u64,
    pub tracker_id: u64,
    pub record: ViolationRecord,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Detection,
    Speed,
    Violation,
    Plate,
    Offload,
    Persistence,
    Report,
}

impl FailureKind {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::DetectVehicles => FailureKind::Detection,
            Stage::CalculateSpeed => FailureKind::Speed,
            Stage::CheckViolation => FailureKind::Violation,
            Stage::ExtractPlate => FailureKind::Plate,
            Stage::Save => FailureKind::Persistence,
            Stage::GenerateReport => FailureKind::Report,
        }
    }
}

/// Record of a failure that was absorbed instead of propagated.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Diagnostic {
    /// `None` for the finalization pass.
    pub frame_id: Option<u64>,
    pub stage: Stage,
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.frame_id {
            Some(id) => write!(f, "[frame {}] {} ({:?}): {}", id, self.stage, self.kind, self.message),
            None => write!(f, "[finalize] {} ({:?}): {}", self.stage, self.kind, self.message),
        }
    }
}

/// Working record threaded through the stages of one graph run.
#[derive(Debug)]
pub struct PipelineContext {
    pub frame: Option<Frame>,
    pub frame_id: Option<u64>,
    pub timestamp: f64,
    pub detections: Option<Vec<TrackedObject>>,
    pub speed_values: BTreeMap<u64, SpeedEstimate>,
    pub violations: Vec<Violation>,
    /// Plates resolved during this run (inline recognition, or offload results at finalization).
    pub violation_plates: Vec<PlateResult>,
    /// Task ids handed to the offload queue during this run.
    pub queued_tasks: Vec<u64>,
    pub saved: Vec<SavedViolation>,
    pub reports: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub trace: Vec<Stage>,
    pub next: Directive,
}

impl PipelineContext {
    pub fn for_frame(frame: Frame, timestamp: f64) -> Self {
        let frame_id = frame.frame_id;
        Self::empty(Some(frame), Some(frame_id), timestamp)
    }

    pub fn for_finalization(violations: Vec<Violation>, violation_plates: Vec<PlateResult>) -> Self {
        let timestamp = violations.last().map_or(0.0, |v| v.timestamp);
        let mut ctx = Self::empty(None, None, timestamp);
        ctx.violations = violations;
        ctx.violation_plates = violation_plates;
        ctx
    }

    fn empty(frame: Option<Frame>, frame_id: Option<u64>, timestamp: f64) -> Self {
        Self {
            frame,
            frame_id,
            timestamp,
            detections: None,
            speed_values: BTreeMap::new(),
            violations: Vec::new(),
            violation_plates: Vec::new(),
            queued_tasks: Vec::new(),
            saved: Vec::new(),
            reports: Vec::new(),
            diagnostics: Vec::new(),
            trace: Vec::new(),
            next: Directive::End,
        }
    }

    pub fn diagnose(&mut self, stage: Stage, kind: FailureKind, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            frame_id: self.frame_id,
            stage,
            kind,
            message: message.into(),
        });
    }
}

/// What one frame produced, with the frame pixels released.
#[derive(Clone, Debug, Serialize)]
pub struct FrameReport {
    pub frame_id: u64,
    pub detections: usize,
    pub speed_values: BTreeMap<u64, SpeedEstimate>,
    pub violations: Vec<Violation>,
    pub violation_plates: Vec<PlateResult>,
    pub queued_tasks: Vec<u64>,
    pub saved: Vec<SavedViolation>,
    pub reports: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub trace: Vec<Stage>,
}

impl FrameReport {
    pub(crate) fn from_context(frame_id: u64, ctx: PipelineContext) -> Self {
        Self {
            frame_id,
            detections: ctx.detections.as_ref().map_or(0, Vec::len),
            speed_values: ctx.speed_values,
            violations: ctx.violations,
            violation_plates: ctx.violation_plates,
            queued_tasks: ctx.queued_tasks,
            saved: ctx.saved,
            reports: ctx.reports,
            diagnostics: ctx.diagnostics,
            trace: ctx.trace,
        }
    }
}
