use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};

use speedwatch::{
    reference_rectangle, BoundingBox, Collaborators, Detector, FailureKind, Frame, FrameReport,
    OffloadConfig, PipelineConfig, PipelineMode, PixelRect, PlateCropConfig, PlateImage,
    PlateMode, PlateRecognizer, ReplayDetector, ReportGenerator, ReportRequest, RunSummary,
    SpeedSettings, Stage, StaticVehicleLookup, TemplateReportGenerator, TrackedObject,
    VehicleInfo, ViewTransformer, ViolationPipeline, ViolationRecord, ViolationSink,
};

const WIDTH: u32 = 200;
const HEIGHT: u32 = 1000;
const FRAMES: u64 = 12;

const RED: [u8; 3] = [200, 0, 0];
const GREEN: [u8; 3] = [0, 200, 0];
const BLUE: [u8; 3] = [0, 0, 200];

const PLATE_A: &str = "30A-111.11";
const PLATE_B: &str = "51F-333.33";
const PLATE_D: &str = "29B-222.22";

/// A scripted vehicle: constant pixel velocity along y, solid color.
struct Vehicle {
    track_id: u64,
    x: u32,
    start_frame: u64,
    px_per_frame: u32,
    color: [u8; 3],
}

/// At 10 fps with an identity calibration:
/// - track 1 (A) and track 3 (C) move 3 px/frame and share a plate color,
///   first measured at 86.4 km/h on frame 4
/// - track 2 (B) moves 1 px/frame and never exceeds 36 km/h
/// - track 4 (D) appears on frame 3 at 4 px/frame, first measured on frame 7
fn scene() -> Vec<Vehicle> {
    vec![
        Vehicle {
            track_id: 1,
            x: 10,
            start_frame: 0,
            px_per_frame: 3,
            color: RED,
        },
        Vehicle {
            track_id: 2,
            x: 40,
            start_frame: 0,
            px_per_frame: 1,
            color: GREEN,
        },
        Vehicle {
            track_id: 3,
            x: 70,
            start_frame: 0,
            px_per_frame: 3,
            color: RED,
        },
        Vehicle {
            track_id: 4,
            x: 130,
            start_frame: 3,
            px_per_frame: 4,
            color: BLUE,
        },
    ]
}

fn vehicle_rect(v: &Vehicle, frame_id: u64) -> Option<PixelRect> {
    if frame_id < v.start_frame {
        return None;
    }
    let bottom = 100 + v.px_per_frame * (frame_id - v.start_frame) as u32;
    Some(PixelRect {
        x: v.x,
        y: bottom - 40,
        width: 20,
        height: 40,
    })
}

fn frames() -> Vec<Frame> {
    (0..FRAMES)
        .map(|frame_id| {
            let mut frame = Frame::blank(frame_id, WIDTH, HEIGHT);
            for v in scene() {
                if let Some(rect) = vehicle_rect(&v, frame_id) {
                    frame.fill(rect, v.color);
                }
            }
            frame
        })
        .collect()
}

fn replay() -> ReplayDetector {
    let mut script = BTreeMap::new();
    for frame_id in 0..FRAMES {
        let objects: Vec<TrackedObject> = scene()
            .iter()
            .filter_map(|v| {
                let r = vehicle_rect(v, frame_id)?;
                Some(TrackedObject {
                    track_id: v.track_id,
                    bbox: BoundingBox::new(
                        r.x as f32,
                        r.y as f32,
                        (r.x + r.width) as f32,
                        (r.y + r.height) as f32,
                    ),
                    confidence: 0.9,
                    class: Default::default(),
                })
            })
            .collect();
        script.insert(frame_id, objects);
    }
    ReplayDetector::new(script)
}

/// Reads the plate from the crop's center color.
struct ColorRecognizer;

impl PlateRecognizer for ColorRecognizer {
    fn name(&self) -> &'static str {
        "color"
    }

    fn recognize(&self, image: &PlateImage) -> Result<String> {
        Ok(match image.center_pixel() {
            Some(RED) => PLATE_A.to_string(),
            Some(GREEN) => PLATE_B.to_string(),
            Some(BLUE) => PLATE_D.to_string(),
            _ => String::new(),
        })
    }
}

struct BlindRecognizer;

impl PlateRecognizer for BlindRecognizer {
    fn name(&self) -> &'static str {
        "blind"
    }

    fn recognize(&self, _image: &PlateImage) -> Result<String> {
        Ok(String::new())
    }
}

#[derive(Clone, Default)]
struct SharedSink {
    rows: Arc<Mutex<Vec<ViolationRecord>>>,
    reject_plate: Option<&'static str>,
    panic_plate: Option<&'static str>,
}

impl ViolationSink for SharedSink {
    fn save(&mut self, record: &ViolationRecord) -> Result<i64> {
        if self.panic_plate == Some(record.plate_number.as_str()) {
            panic!("sink crashed on {}", record.plate_number);
        }
        if self.reject_plate == Some(record.plate_number.as_str()) {
            return Err(anyhow!("disk full"));
        }
        let mut rows = self.rows.lock().map_err(|_| anyhow!("sink poisoned"))?;
        rows.push(record.clone());
        Ok(rows.len() as i64)
    }
}

struct OfflineReporter;

impl ReportGenerator for OfflineReporter {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn explain(&self, _request: &ReportRequest<'_>) -> Result<String> {
        Err(anyhow!("model offline"))
    }
}

/// Panics for one plate, writes a short narrative for the rest.
struct PanickyReporter {
    panic_plate: &'static str,
}

impl ReportGenerator for PanickyReporter {
    fn name(&self) -> &'static str {
        "panicky"
    }

    fn explain(&self, request: &ReportRequest<'_>) -> Result<String> {
        if request.plate == self.panic_plate {
            panic!("report model crashed on {}", request.plate);
        }
        Ok(format!("report for {}", request.plate))
    }
}

/// Fails (or panics) on one frame, replays otherwise.
struct FlakyDetector {
    inner: ReplayDetector,
    fail_on: u64,
    panic: bool,
}

impl Detector for FlakyDetector {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn detect(&mut self, frame: &Frame, confidence: f32, iou: f32) -> Result<Vec<TrackedObject>> {
        if frame.frame_id == self.fail_on {
            if self.panic {
                panic!("detector crashed on frame {}", frame.frame_id);
            }
            return Err(anyhow!("inference timeout"));
        }
        self.inner.detect(frame, confidence, iou)
    }
}

fn config(mode: PipelineMode, plate_mode: PlateMode) -> PipelineConfig {
    PipelineConfig {
        mode,
        plate_mode,
        speed_limit: 60.0,
        confidence_threshold: 0.3,
        iou_threshold: 0.7,
        camera_id: "CAM_01".into(),
        location: "Xuan Thuy - KM 10".into(),
        speed: SpeedSettings {
            fps: 10.0,
            meters_per_unit: 1.0,
            track_ttl_frames: None,
        },
        plate_crop: PlateCropConfig::default(),
        offload: OffloadConfig {
            capacity: 16,
            workers: 2,
            submit_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
        },
    }
}

fn identity() -> ViewTransformer {
    let rect = reference_rectangle(WIDTH as f64, HEIGHT as f64);
    ViewTransformer::new(rect, rect).unwrap()
}

fn registry() -> StaticVehicleLookup {
    let mut vehicles = HashMap::new();
    vehicles.insert(
        PLATE_A.to_string(),
        VehicleInfo {
            id: "00130405771".into(),
            owner: "Ng Ngoc Linh".into(),
            phone: None,
            address: None,
            vehicle_type: "car".into(),
            registered: true,
        },
    );
    StaticVehicleLookup::new(vehicles)
}

fn collaborators(sink: SharedSink) -> Collaborators {
    Collaborators {
        detector: Box::new(replay()),
        recognizer: Arc::new(ColorRecognizer),
        sink: Box::new(sink),
        reporter: Box::new(TemplateReportGenerator),
        lookup: Some(Box::new(registry())),
    }
}

fn run(config: PipelineConfig, collaborators: Collaborators) -> (Vec<FrameReport>, RunSummary) {
    let mut pipeline = ViolationPipeline::new(config, identity(), collaborators).unwrap();
    let reports: Vec<FrameReport> = frames()
        .into_iter()
        .map(|frame| pipeline.process_frame(frame))
        .collect();
    let summary = pipeline.finish().unwrap();
    (reports, summary)
}

fn saved_plates(summary: &RunSummary) -> Vec<&str> {
    summary
        .saved
        .iter()
        .map(|s| s.record.plate_number.as_str())
        .collect()
}

#[test]
fn combined_and_split_modes_save_the_same_violations() {
    let combined_sink = SharedSink::default();
    let (_, combined) = run(
        config(PipelineMode::Combined, PlateMode::Inline),
        collaborators(combined_sink.clone()),
    );
    let (_, split_inline) = run(
        config(PipelineMode::Split, PlateMode::Inline),
        collaborators(SharedSink::default()),
    );
    let split_sink = SharedSink::default();
    let (_, split_offload) = run(
        config(PipelineMode::Split, PlateMode::Offload),
        collaborators(split_sink.clone()),
    );

    assert_eq!(saved_plates(&combined), vec![PLATE_A, PLATE_D]);
    assert_eq!(combined.saved, split_inline.saved);
    assert_eq!(combined.saved, split_offload.saved);
    assert_eq!(combined.reports, split_inline.reports);
    assert_eq!(combined.reports, split_offload.reports);
    assert_eq!(combined.violations_detected, split_offload.violations_detected);
    assert_eq!(
        *combined_sink.rows.lock().unwrap(),
        *split_sink.rows.lock().unwrap()
    );

    let first = &combined.saved[0];
    assert_eq!((first.frame_id, first.tracker_id), (4, 1));
    assert!((first.record.speed - 86.4).abs() < 1e-6);
    assert!((first.record.exceed_speed - 26.4).abs() < 1e-6);
    assert!((first.record.timestamp - 0.4).abs() < 1e-9);
    assert_eq!(first.record.location, "Xuan Thuy - KM 10");

    let second = &combined.saved[1];
    assert_eq!((second.frame_id, second.tracker_id), (7, 4));
    assert!((second.record.speed - 115.2).abs() < 1e-6);

    assert!(combined.reports[0].contains("Ng Ngoc Linh"));
    assert!(combined.reports[1].contains("not found"));
    assert!(combined.diagnostics.is_empty());
    assert_eq!(split_offload.offload.submitted as usize, split_offload.violations_detected);
    assert_eq!(split_offload.offload.dropped, 0);
}

#[test]
fn frame_traces_follow_the_mode_graph() {
    let (combined, _) = run(
        config(PipelineMode::Combined, PlateMode::Inline),
        collaborators(SharedSink::default()),
    );
    let (split, _) = run(
        config(PipelineMode::Split, PlateMode::Offload),
        collaborators(SharedSink::default()),
    );

    let until_check = vec![Stage::DetectVehicles, Stage::CalculateSpeed, Stage::CheckViolation];
    let until_plate = vec![
        Stage::DetectVehicles,
        Stage::CalculateSpeed,
        Stage::CheckViolation,
        Stage::ExtractPlate,
    ];
    let mut full = until_plate.clone();
    full.extend([Stage::Save, Stage::GenerateReport]);
    let mut deduped = until_plate.clone();
    deduped.push(Stage::Save);

    // Too few samples before frame 4: speeds are unknown, not zero.
    assert_eq!(combined[3].trace, until_check);
    assert!(combined[3].speed_values[&1].value().is_none());
    assert_eq!(combined[4].trace, full);
    assert_eq!(combined[5].trace, deduped);
    assert_eq!(combined[4].saved.len(), 1);

    assert_eq!(split[3].trace, until_check);
    assert_eq!(split[4].trace, until_plate);
    assert_eq!(split[4].violations.len(), 2);
    assert_eq!(split[4].queued_tasks.len(), 2);
    assert!(split[4].violation_plates.is_empty());
    assert!(split.iter().all(|r| r.saved.is_empty() && r.reports.is_empty()));

    // The slow vehicle is measured but never reported.
    let slow = split[11].speed_values[&2].value().unwrap();
    assert!(slow > 0.0 && slow < 60.0);
}

#[test]
fn detector_failures_end_the_frame_only() {
    for panic in [false, true] {
        let mut collab = collaborators(SharedSink::default());
        collab.detector = Box::new(FlakyDetector {
            inner: replay(),
            fail_on: 2,
            panic,
        });
        let (frames, summary) = run(config(PipelineMode::Split, PlateMode::Inline), collab);

        assert_eq!(frames[2].trace, vec![Stage::DetectVehicles]);
        assert_eq!(frames[2].detections, 0);
        assert_eq!(frames[2].diagnostics.len(), 1);
        assert_eq!(frames[2].diagnostics[0].kind, FailureKind::Detection);
        if panic {
            assert!(frames[2].diagnostics[0].message.contains("panicked"));
        }
        assert_eq!(summary.frames_processed, FRAMES);
        assert_eq!(saved_plates(&summary), vec![PLATE_A, PLATE_D]);
        assert_eq!(summary.diagnostics.len(), 1);
    }
}

#[test]
fn failed_save_does_not_block_other_plates() {
    for mode in [PipelineMode::Combined, PipelineMode::Split] {
        let sink = SharedSink {
            reject_plate: Some(PLATE_A),
            ..SharedSink::default()
        };
        let (_, summary) = run(config(mode, PlateMode::Inline), collaborators(sink.clone()));

        assert_eq!(saved_plates(&summary), vec![PLATE_D]);
        assert_eq!(summary.reports.len(), 1);
        let persistence: Vec<_> = summary
            .diagnostics
            .iter()
            .filter(|d| d.kind == FailureKind::Persistence)
            .collect();
        // The rejected plate is not retried on later frames.
        assert_eq!(persistence.len(), 1);
        assert!(persistence[0].message.contains(PLATE_A));
        assert_eq!(sink.rows.lock().unwrap().len(), 1);
    }
}

#[test]
fn report_failures_fall_back_to_placeholder() {
    let mut collab = collaborators(SharedSink::default());
    collab.reporter = Box::new(OfflineReporter);
    let (_, summary) = run(config(PipelineMode::Split, PlateMode::Offload), collab);

    assert_eq!(summary.saved.len(), 2);
    assert_eq!(summary.reports.len(), 2);
    for (saved, report) in summary.saved.iter().zip(&summary.reports) {
        assert!(report.contains("report unavailable"));
        assert!(report.contains(&saved.record.plate_number));
    }
    let report_failures = summary
        .diagnostics
        .iter()
        .filter(|d| d.kind == FailureKind::Report && d.frame_id.is_none())
        .count();
    assert_eq!(report_failures, 2);
}

#[test]
fn unreadable_plates_are_never_saved() {
    for (mode, plate_mode) in [
        (PipelineMode::Combined, PlateMode::Inline),
        (PipelineMode::Split, PlateMode::Offload),
    ] {
        let sink = SharedSink::default();
        let mut collab = collaborators(sink.clone());
        collab.recognizer = Arc::new(BlindRecognizer);
        let (_, summary) = run(config(mode, plate_mode), collab);

        assert!(summary.violations_detected > 0);
        assert!(summary.saved.is_empty());
        assert!(summary.reports.is_empty());
        assert!(summary.diagnostics.is_empty());
        assert!(sink.rows.lock().unwrap().is_empty());
    }
}

#[test]
fn combined_mode_requires_inline_plates() {
    let result = ViolationPipeline::new(
        config(PipelineMode::Combined, PlateMode::Offload),
        identity(),
        collaborators(SharedSink::default()),
    );
    assert!(result.is_err());
}

#[test]
fn panicking_reporter_keeps_reports_aligned_with_saves() {
    for (mode, plate_mode) in [
        (PipelineMode::Combined, PlateMode::Inline),
        (PipelineMode::Split, PlateMode::Offload),
    ] {
        let mut collab = collaborators(SharedSink::default());
        collab.reporter = Box::new(PanickyReporter {
            panic_plate: PLATE_A,
        });
        let (_, summary) = run(config(mode, plate_mode), collab);

        assert_eq!(saved_plates(&summary), vec![PLATE_A, PLATE_D]);
        assert_eq!(summary.reports.len(), 2);
        assert!(summary.reports[0].contains("report unavailable"));
        assert!(summary.reports[0].contains(PLATE_A));
        assert_eq!(summary.reports[1], format!("report for {}", PLATE_D));

        let failures: Vec<_> = summary
            .diagnostics
            .iter()
            .filter(|d| d.kind == FailureKind::Report)
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("panicked"));
    }
}

#[test]
fn panicking_sink_only_loses_that_plate() {
    for (mode, plate_mode) in [
        (PipelineMode::Combined, PlateMode::Inline),
        (PipelineMode::Split, PlateMode::Offload),
    ] {
        let sink = SharedSink {
            panic_plate: Some(PLATE_A),
            ..SharedSink::default()
        };
        let (_, summary) = run(config(mode, plate_mode), collaborators(sink.clone()));

        assert_eq!(saved_plates(&summary), vec![PLATE_D]);
        assert_eq!(summary.reports.len(), 1);
        assert!(summary.reports[0].contains(PLATE_D));
        let persistence: Vec<_> = summary
            .diagnostics
            .iter()
            .filter(|d| d.kind == FailureKind::Persistence)
            .collect();
        assert_eq!(persistence.len(), 1);
        assert!(persistence[0].message.contains(PLATE_A));
        assert!(persistence[0].message.contains("panicked"));
        assert_eq!(sink.rows.lock().unwrap().len(), 1);
    }
}
