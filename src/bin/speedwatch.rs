//! speedwatch - speed-violation runner
//!
//! This binary:
//! 1. Loads configuration (SPEEDWATCH_CONFIG file + SPEEDWATCH_* env overrides)
//! 2. Reads frames from a local source and replays pre-tracked detections
//! 3. Runs the violation pipeline until the source ends or Ctrl-C
//! 4. Drains plate recognition, finalizes, and prints one JSON line per saved violation

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use speedwatch::{
    remote::{ChatClient, RemotePlateRecognizer, RemoteReportGenerator},
    Collaborators, FileConfig, FileSource, FrameSource, ReplayDetector, ReportGenerator,
    SpeedwatchConfig, SqliteViolationStore, StaticVehicleLookup, TemplateReportGenerator,
    VehicleLookup, ViolationPipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Frame source: `stub://WIDTHxHEIGHT` or a directory of JPEG/PNG frames.
    #[arg(long, default_value = "stub://1920x1080")]
    frames: String,

    /// Pre-tracked detections as JSON (`{"frames": {"<frame_id>": [...]}}`).
    #[arg(long)]
    tracks: PathBuf,

    /// Vehicle registry JSON keyed by plate.
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Stop after this many frames.
    #[arg(long)]
    max_frames: Option<u64>,

    /// Use the built-in narrative template instead of the remote report model.
    #[arg(long)]
    template_reports: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = SpeedwatchConfig::load()?;
    let remote = config
        .remote
        .as_ref()
        .ok_or_else(|| anyhow!("plate recognition requires a remote section in the config"))?;

    let detector = ReplayDetector::from_json_file(&args.tracks)?;
    log::info!(
        "replaying {} tracked frame(s) from {}",
        detector.frame_count(),
        args.tracks.display()
    );

    let recognizer = RemotePlateRecognizer::new(ChatClient::from_settings(remote)?, &remote.ocr_model);
    let reporter: Box<dyn ReportGenerator> = if args.template_reports {
        Box::new(TemplateReportGenerator)
    } else {
        Box::new(RemoteReportGenerator::new(
            ChatClient::from_settings(remote)?,
            &remote.report_model,
        ))
    };
    let lookup: Option<Box<dyn VehicleLookup>> = match &args.registry {
        Some(path) => {
            let registry = StaticVehicleLookup::from_json_file(path)?;
            log::info!("vehicle registry: {} plate(s)", registry.len());
            Some(Box::new(registry))
        }
        None => None,
    };

    let collaborators = Collaborators {
        detector: Box::new(detector),
        recognizer: Arc::new(recognizer),
        sink: Box::new(SqliteViolationStore::open(&config.db_path)?),
        reporter,
        lookup,
    };
    let mut pipeline = ViolationPipeline::new(
        config.pipeline_config(),
        config.view_transformer()?,
        collaborators,
    )?;

    let mut source = FileSource::new(FileConfig {
        path: args.frames.clone(),
        max_frames: args.max_frames,
    })?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "speedwatch running: camera {} at {}, writing to {}",
        config.camera.camera_id,
        config.camera.location,
        config.db_path
    );

    while !stop.load(Ordering::SeqCst) {
        let Some(frame) = source.next_frame()? else {
            break;
        };
        let report = pipeline.process_frame(frame);
        for diagnostic in &report.diagnostics {
            log::warn!("{}", diagnostic);
        }
    }
    if stop.load(Ordering::SeqCst) {
        log::info!("shutdown signal received, finalizing");
    }

    let summary = pipeline.finish()?;
    for (saved, report) in summary.saved.iter().zip(summary.reports.iter()) {
        let line = serde_json::json!({
            "id": saved.id,
            "frame_id": saved.frame_id,
            "tracker_id": saved.tracker_id,
            "violation": saved.record,
            "report": report,
        });
        println!("{}", line);
    }
    log::info!(
        "processed {} frame(s): {} violation(s), {} saved, {} plate task(s) dropped",
        summary.frames_processed,
        summary.violations_detected,
        summary.saved.len(),
        summary.offload.dropped
    );
    Ok(())
}
