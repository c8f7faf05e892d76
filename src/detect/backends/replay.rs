use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::detect::backend::Detector;
use crate::detect::result::TrackedObject;
use crate::frame::Frame;

/// Replays tracker output recorded offline.
///
/// The replay file maps frame ids to the tracked objects seen in that frame:
///
/// ```json
/// { "frames": { "0": [ { "track_id": 1, "bbox": {"x1": 0, "y1": 0, "x2": 10, "y2": 10},
///                        "confidence": 0.9, "class": "car" } ] } }
/// ```
///
/// Frames absent from the file yield no objects. Suppression already happened
/// when the file was recorded, so the IoU threshold is ignored.
pub struct ReplayDetector {
    frames: BTreeMap<u64, Vec<TrackedObject>>,
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
    frames: BTreeMap<u64, Vec<TrackedObject>>,
}

impl ReplayDetector {
    pub fn new(frames: BTreeMap<u64, Vec<TrackedObject>>) -> Self {
        Self { frames }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let file: ReplayFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid replay file: {}", e))?;
        Ok(Self::new(file.frames))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read replay file {}: {}", path.display(), e))?;
        Self::from_json_str(&raw)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Detector for ReplayDetector {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        _iou_threshold: f32,
    ) -> Result<Vec<TrackedObject>> {
        Ok(self
            .frames
            .get(&frame.frame_id)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|obj| obj.confidence > confidence_threshold)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
