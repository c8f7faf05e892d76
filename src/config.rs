use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::offload::{
    OffloadConfig, DEFAULT_POLL_INTERVAL_MS, DEFAULT_QUEUE_CAPACITY, DEFAULT_SUBMIT_TIMEOUT_MS,
    DEFAULT_WORKERS,
};
use crate::pipeline::{PipelineConfig, PipelineMode, PlateMode};
use crate::plate::PlateCropConfig;
use crate::speed::SpeedSettings;
use crate::transform::{reference_rectangle, Quad, ViewTransformer};

const DEFAULT_DB_PATH: &str = "data/violations.db";
const DEFAULT_CAMERA_ID: &str = "CAM_01";
const DEFAULT_LOCATION: &str = "unknown";
const DEFAULT_FPS: f64 = 25.0;
const DEFAULT_WIDTH: u32 = 1920;
const DEFAULT_HEIGHT: u32 = 1080;
const DEFAULT_REFERENCE_WIDTH: f64 = 25.0;
const DEFAULT_REFERENCE_HEIGHT: f64 = 250.0;
const DEFAULT_METERS_PER_UNIT: f64 = 1.0;
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.3;
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_SPEED_LIMIT: f64 = 60.0;
const DEFAULT_REMOTE_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_REMOTE_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_OCR_MODEL: &str = "gpt-4o-mini";
const DEFAULT_REPORT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct SpeedwatchConfigFile {
    db_path: Option<String>,
    camera: Option<CameraConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    detection: Option<DetectionConfigFile>,
    enforcement: Option<EnforcementConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    plate: Option<PlateConfigFile>,
    offload: Option<OffloadConfigFile>,
    remote: Option<RemoteConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    camera_id: Option<String>,
    location: Option<String>,
    fps: Option<f64>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    source_points: Option<Vec<[f64; 2]>>,
    reference_width: Option<f64>,
    reference_height: Option<f64>,
    meters_per_unit: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct EnforcementConfigFile {
    speed_limit: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    mode: Option<PipelineMode>,
    plate_mode: Option<PlateMode>,
    track_ttl_frames: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PlateConfigFile {
    height_fraction: Option<f32>,
    expand_ratio: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct OffloadConfigFile {
    capacity: Option<usize>,
    workers: Option<usize>,
    submit_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    base_url: Option<String>,
    api_key_env: Option<String>,
    ocr_model: Option<String>,
    report_model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SpeedwatchConfig {
    pub db_path: String,
    pub camera: CameraSettings,
    pub calibration: CalibrationSettings,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub speed_limit: f64,
    pub mode: PipelineMode,
    pub plate_mode: PlateMode,
    pub track_ttl_frames: Option<u64>,
    pub plate_crop: PlateCropConfig,
    pub offload: OffloadConfig,
    /// Present only when the file has a `remote` section.
    pub remote: Option<RemoteSettings>,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub camera_id: String,
    pub location: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct CalibrationSettings {
    /// Road quadrilateral in pixels. Defaults to the frame corners.
    pub source_points: Option<Quad>,
    pub reference_width: f64,
    pub reference_height: f64,
    pub meters_per_unit: f64,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    /// Name of the env var holding the API key; the key itself is never stored here.
    pub api_key_env: String,
    pub ocr_model: String,
    pub report_model: String,
    pub timeout: Duration,
}

impl SpeedwatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SPEEDWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SpeedwatchConfigFile) -> Result<Self> {
        let camera = file.camera.unwrap_or_default();
        let calibration = file.calibration.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let plate = file.plate.unwrap_or_default();
        let offload = file.offload.unwrap_or_default();

        let source_points = match calibration.source_points {
            Some(points) => Some(to_quad(&points)?),
            None => None,
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            camera: CameraSettings {
                camera_id: camera
                    .camera_id
                    .unwrap_or_else(|| DEFAULT_CAMERA_ID.to_string()),
                location: camera
                    .location
                    .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
                fps: camera.fps.unwrap_or(DEFAULT_FPS),
                width: camera.width.unwrap_or(DEFAULT_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_HEIGHT),
            },
            calibration: CalibrationSettings {
                source_points,
                reference_width: calibration
                    .reference_width
                    .unwrap_or(DEFAULT_REFERENCE_WIDTH),
                reference_height: calibration
                    .reference_height
                    .unwrap_or(DEFAULT_REFERENCE_HEIGHT),
                meters_per_unit: calibration
                    .meters_per_unit
                    .unwrap_or(DEFAULT_METERS_PER_UNIT),
            },
            confidence_threshold: detection
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
            iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
            speed_limit: file
                .enforcement
                .and_then(|e| e.speed_limit)
                .unwrap_or(DEFAULT_SPEED_LIMIT),
            mode: pipeline.mode.unwrap_or_default(),
            plate_mode: pipeline.plate_mode.unwrap_or_default(),
            track_ttl_frames: pipeline.track_ttl_frames,
            plate_crop: PlateCropConfig {
                height_fraction: plate
                    .height_fraction
                    .unwrap_or(PlateCropConfig::default().height_fraction),
                expand_ratio: plate
                    .expand_ratio
                    .unwrap_or(PlateCropConfig::default().expand_ratio),
            },
            offload: OffloadConfig {
                capacity: offload.capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
                workers: offload.workers.unwrap_or(DEFAULT_WORKERS),
                submit_timeout: Duration::from_millis(
                    offload.submit_timeout_ms.unwrap_or(DEFAULT_SUBMIT_TIMEOUT_MS),
                ),
                poll_interval: Duration::from_millis(
                    offload.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            remote: file.remote.map(|remote| RemoteSettings {
                base_url: remote
                    .base_url
                    .unwrap_or_else(|| DEFAULT_REMOTE_BASE_URL.to_string()),
                api_key_env: remote
                    .api_key_env
                    .unwrap_or_else(|| DEFAULT_REMOTE_API_KEY_ENV.to_string()),
                ocr_model: remote
                    .ocr_model
                    .unwrap_or_else(|| DEFAULT_OCR_MODEL.to_string()),
                report_model: remote
                    .report_model
                    .unwrap_or_else(|| DEFAULT_REPORT_MODEL.to_string()),
                timeout: Duration::from_secs(
                    remote.timeout_secs.unwrap_or(DEFAULT_REMOTE_TIMEOUT_SECS),
                ),
            }),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SPEEDWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(camera_id) = std::env::var("SPEEDWATCH_CAMERA_ID") {
            if !camera_id.trim().is_empty() {
                self.camera.camera_id = camera_id;
            }
        }
        if let Ok(location) = std::env::var("SPEEDWATCH_LOCATION") {
            if !location.trim().is_empty() {
                self.camera.location = location;
            }
        }
        if let Ok(limit) = std::env::var("SPEEDWATCH_SPEED_LIMIT") {
            self.speed_limit = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("SPEEDWATCH_SPEED_LIMIT must be a number of km/h"))?;
        }
        if let Ok(fps) = std::env::var("SPEEDWATCH_FPS") {
            self.camera.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("SPEEDWATCH_FPS must be a number"))?;
        }
        if let Ok(mode) = std::env::var("SPEEDWATCH_MODE") {
            self.mode = mode
                .parse()
                .map_err(|e| anyhow!("SPEEDWATCH_MODE: {}", e))?;
        }
        if let Ok(mode) = std::env::var("SPEEDWATCH_PLATE_MODE") {
            self.plate_mode = mode
                .parse()
                .map_err(|e| anyhow!("SPEEDWATCH_PLATE_MODE: {}", e))?;
        }
        if let Ok(workers) = std::env::var("SPEEDWATCH_OCR_WORKERS") {
            self.offload.workers = workers
                .trim()
                .parse()
                .map_err(|_| anyhow!("SPEEDWATCH_OCR_WORKERS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.camera.camera_id.trim().is_empty() {
            return Err(anyhow!("camera_id must not be empty"));
        }
        if self.camera.width < 2 || self.camera.height < 2 {
            return Err(anyhow!("camera frame must be at least 2x2 pixels"));
        }
        if self.calibration.reference_width < 2.0 || self.calibration.reference_height < 2.0 {
            return Err(anyhow!("reference rectangle must be at least 2x2 units"));
        }
        if !(self.calibration.meters_per_unit.is_finite() && self.calibration.meters_per_unit > 0.0)
        {
            return Err(anyhow!("meters_per_unit must be a positive number"));
        }
        if self.offload.capacity == 0 {
            return Err(anyhow!("offload capacity must be at least 1"));
        }
        if self.offload.workers == 0 {
            return Err(anyhow!("offload workers must be at least 1"));
        }
        if self.track_ttl_frames == Some(0) {
            return Err(anyhow!("track_ttl_frames must be greater than zero"));
        }
        self.pipeline_config().validate()
    }

    /// Library-level settings for `ViolationPipeline::new`.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mode: self.mode,
            plate_mode: self.plate_mode,
            speed_limit: self.speed_limit,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            camera_id: self.camera.camera_id.clone(),
            location: self.camera.location.clone(),
            speed: SpeedSettings {
                fps: self.camera.fps,
                meters_per_unit: self.calibration.meters_per_unit,
                track_ttl_frames: self.track_ttl_frames,
            },
            plate_crop: self.plate_crop,
            offload: self.offload.clone(),
        }
    }

    /// Homography from the calibrated road quadrilateral (or the full frame)
    /// onto the reference rectangle.
    pub fn view_transformer(&self) -> Result<ViewTransformer> {
        let cal = &self.calibration;
        match cal.source_points {
            Some(source) => ViewTransformer::new(
                source,
                reference_rectangle(cal.reference_width, cal.reference_height),
            ),
            None => ViewTransformer::for_frame(
                self.camera.width,
                self.camera.height,
                cal.reference_width,
                cal.reference_height,
            ),
        }
    }
}

fn to_quad(points: &[[f64; 2]]) -> Result<Quad> {
    <Quad>::try_from(points).map_err(|_| {
        anyhow!(
            "calibration source_points must hold exactly 4 points, got {}",
            points.len()
        )
    })
}

fn read_config_file(path: &Path) -> Result<SpeedwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
