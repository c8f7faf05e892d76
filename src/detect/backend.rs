use anyhow::Result;

use crate::detect::result::TrackedObject;
use crate::frame::Frame;

/// Detector + tracker collaborator.
///
/// Implementations own both the object detector and the multi-object tracker:
/// every returned `TrackedObject` carries a `track_id` that stays stable for the
/// same physical object across frames and is never reused.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect and track objects in a frame.
    ///
    /// Objects below `confidence_threshold` are discarded; overlapping boxes are
    /// suppressed at `iou_threshold` before tracking.
    fn detect(
        &mut self,
        frame: &Frame,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<TrackedObject>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
