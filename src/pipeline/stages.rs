//! Stage bodies. Each reads the context, calls its collaborator, writes its
//! output back and tells the graph whether the successor has input.
//!
//! Errors returned here are turned into diagnostics by the runner. Failures
//! that only affect one item (a single plate save, a single report) are
//! recorded in place and the stage carries on. Per-item collaborator calls are
//! panic-guarded so `saved` and `reports` stay index-aligned.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, Result};

use crate::offload::{resolve_plate, PlateTask, SubmitOutcome};
use crate::plate::crop_plate;
use crate::report::{placeholder_report, ReportRequest};

use super::accumulator::AccumulatedState;
use super::context::{FailureKind, PipelineContext, SavedViolation, Violation};
use super::stage::{Flow, Stage};
use super::{panic_message, PipelineConfig, Services};

/// Run one collaborator call, turning a panic into an error.
fn guarded<T>(call: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

pub(crate) fn run(
    stage: Stage,
    ctx: &mut PipelineContext,
    services: &mut Services,
    acc: &mut AccumulatedState,
    config: &PipelineConfig,
) -> Result<Flow> {
    match stage {
        Stage::DetectVehicles => detect_vehicles(ctx, services, config),
        Stage::CalculateSpeed => calculate_speed(ctx, services),
        Stage::CheckViolation => check_violation(ctx, config),
        Stage::ExtractPlate => extract_plate(ctx, services, config),
        Stage::Save => save(ctx, services, acc),
        Stage::GenerateReport => generate_report(ctx, services),
    }
}

fn detect_vehicles(
    ctx: &mut PipelineContext,
    services: &mut Services,
    config: &PipelineConfig,
) -> Result<Flow> {
    let frame = ctx
        .frame
        .as_ref()
        .ok_or_else(|| anyhow!("no frame to run detection on"))?;
    let objects = services
        .detector
        .detect(frame, config.confidence_threshold, config.iou_threshold)
        .map_err(|e| anyhow!("detector {} failed: {}", services.detector.name(), e))?;
    log::debug!("[detect] frame {}: {} object(s)", frame.frame_id, objects.len());
    ctx.detections = Some(objects);
    Ok(Flow::Advance)
}

fn calculate_speed(ctx: &mut PipelineContext, services: &mut Services) -> Result<Flow> {
    let Some(detections) = ctx.detections.as_ref() else {
        return Ok(Flow::Halt);
    };
    services.estimator.update(detections);
    ctx.speed_values = detections
        .iter()
        .map(|obj| (obj.track_id, services.estimator.speed_of(obj.track_id)))
        .collect();
    Ok(Flow::Advance)
}

fn check_violation(ctx: &mut PipelineContext, config: &PipelineConfig) -> Result<Flow> {
    let (Some(detections), Some(frame_id)) = (ctx.detections.as_ref(), ctx.frame_id) else {
        return Ok(Flow::Halt);
    };

    let mut seen = HashSet::new();
    let mut violations = Vec::new();
    for obj in detections {
        if !seen.insert(obj.track_id) {
            continue;
        }
        // Tracks without enough history are never reported.
        let Some(speed) = ctx.speed_values.get(&obj.track_id).and_then(|s| s.value()) else {
            continue;
        };
        if speed > config.speed_limit {
            log::info!(
                "[violation] frame {} track {}: {:.2} km/h over {:.0} km/h limit",
                frame_id,
                obj.track_id,
                speed,
                config.speed_limit
            );
            violations.push(Violation {
                tracker_id: obj.track_id,
                frame_id,
                speed,
                speed_limit: config.speed_limit,
                exceed_speed: speed - config.speed_limit,
                camera_id: config.camera_id.clone(),
                location: config.location.clone(),
                timestamp: ctx.timestamp,
            });
        }
    }

    let flow = if violations.is_empty() {
        Flow::Halt
    } else {
        Flow::Advance
    };
    ctx.violations = violations;
    Ok(flow)
}

fn extract_plate(
    ctx: &mut PipelineContext,
    services: &mut Services,
    config: &PipelineConfig,
) -> Result<Flow> {
    let frame = ctx
        .frame
        .as_ref()
        .ok_or_else(|| anyhow!("no frame to crop plates from"))?;
    let detections = ctx.detections.as_deref().unwrap_or_default();

    let mut plates = Vec::new();
    let mut queued = Vec::new();
    let mut dropped = Vec::new();
    for violation in &ctx.violations {
        let Some(obj) = detections.iter().find(|o| o.track_id == violation.tracker_id) else {
            continue;
        };
        let image = match crop_plate(frame, &obj.bbox, &config.plate_crop) {
            Ok(image) => image,
            Err(e) => {
                log::debug!("[plate] track {}: {}", violation.tracker_id, e);
                continue;
            }
        };
        let task = PlateTask {
            task_id: services.next_task_id,
            frame_id: violation.frame_id,
            tracker_id: violation.tracker_id,
            image,
        };
        services.next_task_id += 1;

        match services.offload.as_mut() {
            Some(queue) => {
                let task_id = task.task_id;
                match queue.submit(task)? {
                    SubmitOutcome::Queued => queued.push(task_id),
                    SubmitOutcome::Dropped => dropped.push((task_id, violation.tracker_id)),
                }
            }
            None => plates.push(resolve_plate(services.recognizer.as_ref(), &task)),
        }
    }

    for (task_id, tracker_id) in dropped {
        ctx.diagnose(
            Stage::ExtractPlate,
            FailureKind::Offload,
            format!("plate queue full; task {} for track {} dropped", task_id, tracker_id),
        );
    }
    ctx.violation_plates.extend(plates);
    ctx.queued_tasks.extend(queued);
    Ok(Flow::Advance)
}

fn save(
    ctx: &mut PipelineContext,
    services: &mut Services,
    acc: &mut AccumulatedState,
) -> Result<Flow> {
    let pairs = acc.select_unsaved(&ctx.violations, &ctx.violation_plates);
    if pairs.is_empty() {
        return Ok(Flow::Halt);
    }

    for (violation, plate) in pairs {
        let record = violation.to_record(&plate);
        match guarded(|| services.sink.save(&record)) {
            Ok(id) => {
                log::info!(
                    "[save] violation {} for plate {} at {:.2} km/h",
                    id,
                    plate,
                    record.speed
                );
                ctx.saved.push(SavedViolation {
                    id,
                    frame_id: violation.frame_id,
                    tracker_id: violation.tracker_id,
                    record,
                });
            }
            Err(e) => {
                log::warn!("[save] failed to persist plate {}: {}", plate, e);
                ctx.diagnose(
                    Stage::Save,
                    FailureKind::Persistence,
                    format!("plate {}: {}", plate, e),
                );
            }
        }
    }

    Ok(if ctx.saved.is_empty() {
        Flow::Halt
    } else {
        Flow::Advance
    })
}

fn generate_report(ctx: &mut PipelineContext, services: &mut Services) -> Result<Flow> {
    let mut failures = Vec::new();
    for saved in &ctx.saved {
        let plate = saved.record.plate_number.as_str();
        let outcome = guarded(|| {
            let vehicle = services.lookup.as_ref().and_then(|l| l.lookup(plate));
            services.reporter.explain(&ReportRequest {
                plate,
                speed: saved.record.speed,
                speed_limit: saved.record.speed_limit,
                vehicle: vehicle.as_ref(),
            })
        });
        match outcome {
            Ok(text) => ctx.reports.push(text),
            Err(e) => {
                log::warn!(
                    "[report] {} failed for plate {}: {}",
                    services.reporter.name(),
                    plate,
                    e
                );
                ctx.reports.push(placeholder_report(plate, &e));
                failures.push(format!("plate {}: {}", plate, e));
            }
        }
    }
    for message in failures {
        ctx.diagnose(Stage::GenerateReport, FailureKind::Report, message);
    }
    Ok(Flow::Advance)
}
