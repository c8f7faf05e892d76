//! Violation pipeline: per-frame stage graph, accumulated state and the
//! end-of-stream finalization pass.
//!
//! In `Combined` mode every frame runs detection through reporting. In `Split`
//! mode frames stop after plate extraction and saving and reporting run once,
//! after the offload queue (if any) has been drained. Both modes select the
//! same saved violations for the same input.

mod accumulator;
mod context;
mod stage;
mod stages;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detector;
use crate::frame::Frame;
use crate::offload::{OffloadConfig, OffloadQueue, OffloadStats};
use crate::plate::{PlateCropConfig, PlateRecognizer};
use crate::report::{ReportGenerator, VehicleLookup};
use crate::speed::{SpeedEstimator, SpeedSettings};
use crate::storage::ViolationSink;
use crate::transform::ViewTransformer;

pub use accumulator::AccumulatedState;
pub use context::{
    Diagnostic, FailureKind, FrameReport, PipelineContext, SavedViolation, Violation,
};
pub use stage::{Directive, Flow, Graph, Stage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Combined,
    #[default]
    Split,
}

impl std::str::FromStr for PipelineMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "combined" => Ok(PipelineMode::Combined),
            "split" => Ok(PipelineMode::Split),
            other => Err(anyhow!("unknown pipeline mode {:?} (expected combined or split)", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlateMode {
    Inline,
    #[default]
    Offload,
}

impl std::str::FromStr for PlateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(PlateMode::Inline),
            "offload" => Ok(PlateMode::Offload),
            other => Err(anyhow!("unknown plate mode {:?} (expected inline or offload)", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub mode: PipelineMode,
    pub plate_mode: PlateMode,
    /// km/h; strictly greater speeds are violations.
    pub speed_limit: f64,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub camera_id: String,
    pub location: String,
    pub speed: SpeedSettings,
    pub plate_crop: PlateCropConfig,
    pub offload: OffloadConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.speed_limit.is_finite() && self.speed_limit > 0.0) {
            return Err(anyhow!("speed_limit must be a positive number"));
        }
        self.speed.validate()?;
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!("iou_threshold must be within [0, 1]"));
        }
        if self.mode == PipelineMode::Combined && self.plate_mode == PlateMode::Offload {
            // Offload results only exist after the drain barrier, which never
            // runs between frames.
            return Err(anyhow!("combined mode requires inline plate recognition"));
        }
        self.plate_crop.validate()
    }
}

/// Collaborators injected into the pipeline.
pub struct Collaborators {
    pub detector: Box<dyn Detector>,
    pub recognizer: Arc<dyn PlateRecognizer>,
    pub sink: Box<dyn ViolationSink>,
    pub reporter: Box<dyn ReportGenerator>,
    pub lookup: Option<Box<dyn VehicleLookup>>,
}

pub(crate) struct Services {
    detector: Box<dyn Detector>,
    estimator: SpeedEstimator,
    recognizer: Arc<dyn PlateRecognizer>,
    offload: Option<OffloadQueue>,
    sink: Box<dyn ViolationSink>,
    reporter: Box<dyn ReportGenerator>,
    lookup: Option<Box<dyn VehicleLookup>>,
    next_task_id: u64,
}

/// Outcome of a whole run.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub frames_processed: u64,
    pub violations_detected: usize,
    pub saved: Vec<SavedViolation>,
    pub reports: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub offload: OffloadStats,
}

pub struct ViolationPipeline {
    config: PipelineConfig,
    services: Services,
    acc: AccumulatedState,
    diagnostics: Vec<Diagnostic>,
    frames_processed: u64,
}

impl ViolationPipeline {
    pub fn new(
        config: PipelineConfig,
        transformer: ViewTransformer,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let estimator = SpeedEstimator::new(transformer, &config.speed)?;
        let mut detector = collaborators.detector;
        detector.warm_up()?;

        let offload = match config.plate_mode {
            PlateMode::Offload => Some(OffloadQueue::start(
                &config.offload,
                collaborators.recognizer.clone(),
            )?),
            PlateMode::Inline => None,
        };
        log::info!(
            "violation pipeline ready: mode {:?}, plates {:?}, detector {}, limit {:.0} km/h",
            config.mode,
            config.plate_mode,
            detector.name(),
            config.speed_limit
        );

        Ok(Self {
            services: Services {
                detector,
                estimator,
                recognizer: collaborators.recognizer,
                offload,
                sink: collaborators.sink,
                reporter: collaborators.reporter,
                lookup: collaborators.lookup,
                next_task_id: 0,
            },
            config,
            acc: AccumulatedState::new(),
            diagnostics: Vec::new(),
            frames_processed: 0,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn accumulated(&self) -> &AccumulatedState {
        &self.acc
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn offload_stats(&self) -> OffloadStats {
        self.services
            .offload
            .as_ref()
            .map(OffloadQueue::stats)
            .unwrap_or_default()
    }

    /// Run one frame through the per-frame graph. Stage failures end the frame
    /// and are reported as diagnostics; they never stop the pipeline.
    pub fn process_frame(&mut self, frame: Frame) -> FrameReport {
        let frame_id = frame.frame_id;
        let timestamp = frame_id as f64 / self.config.speed.fps;
        let mut ctx = PipelineContext::for_frame(frame, timestamp);
        let graph = match self.config.mode {
            PipelineMode::Combined => Graph::Combined,
            PipelineMode::Split => Graph::PerFrame,
        };

        self.run_graph(graph, &mut ctx);
        ctx.frame = None;

        self.acc.merge(&ctx);
        self.diagnostics.extend(ctx.diagnostics.iter().cloned());
        self.frames_processed += 1;
        FrameReport::from_context(frame_id, ctx)
    }

    /// Drain the offload queue and, in split mode, run save and report over
    /// everything accumulated.
    pub fn finish(mut self) -> Result<RunSummary> {
        let mut offload = self.offload_stats();
        if let Some(queue) = self.services.offload.take() {
            let drained = queue.drain()?;
            offload = drained.stats();
            self.acc.absorb(drained);
        }

        if self.config.mode == PipelineMode::Split {
            let mut ctx = PipelineContext::for_finalization(
                self.acc.violations.clone(),
                self.acc.violation_plates.clone(),
            );
            self.run_graph(Graph::Finalize, &mut ctx);
            self.acc.saved.extend(ctx.saved.iter().cloned());
            self.acc.reports.extend(ctx.reports.iter().cloned());
            self.diagnostics.extend(ctx.diagnostics);
        }

        log::info!(
            "run finished: {} frame(s), {} violation(s), {} saved, {} diagnostic(s)",
            self.frames_processed,
            self.acc.violations.len(),
            self.acc.saved.len(),
            self.diagnostics.len()
        );
        Ok(RunSummary {
            frames_processed: self.frames_processed,
            violations_detected: self.acc.violations.len(),
            saved: self.acc.saved,
            reports: self.acc.reports,
            diagnostics: self.diagnostics,
            offload,
        })
    }

    fn run_graph(&mut self, graph: Graph, ctx: &mut PipelineContext) {
        let mut directive = Directive::Run(graph.entry());
        while let Directive::Run(stage) = directive {
            ctx.trace.push(stage);
            let services = &mut self.services;
            let acc = &mut self.acc;
            let config = &self.config;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                stages::run(stage, ctx, services, acc, config)
            }));
            let flow = match outcome {
                Ok(Ok(flow)) => flow,
                Ok(Err(e)) => {
                    log::warn!("[{}] {:?}: {}", stage, ctx.frame_id, e);
                    ctx.diagnose(stage, FailureKind::for_stage(stage), e.to_string());
                    Flow::Halt
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!("[{}] {:?}: stage panicked: {}", stage, ctx.frame_id, message);
                    ctx.diagnose(
                        stage,
                        FailureKind::for_stage(stage),
                        format!("stage panicked: {}", message),
                    );
                    Flow::Halt
                }
            };
            directive = graph.transition(stage, flow);
            ctx.next = directive;
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
