//! Plate crop heuristic and the recognition collaborator boundary.

use anyhow::{anyhow, Result};

use crate::frame::{BoundingBox, Frame, PixelRect, PlateImage};

pub const DEFAULT_PLATE_HEIGHT_FRACTION: f32 = 0.35;
pub const DEFAULT_PLATE_EXPAND_RATIO: f32 = 0.10;

/// Plate-recognition collaborator.
///
/// An empty string means "no plate read". Errors are folded into an empty
/// result at the call site, so implementations may simply propagate them.
pub trait PlateRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, image: &PlateImage) -> Result<String>;
}

/// Geometry of the plate crop relative to a vehicle bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlateCropConfig {
    /// Fraction of the box height, measured up from the bottom edge.
    pub height_fraction: f32,
    /// Horizontal growth on each side, as a fraction of the box width.
    pub expand_ratio: f32,
}

impl Default for PlateCropConfig {
    fn default() -> Self {
        Self {
            height_fraction: DEFAULT_PLATE_HEIGHT_FRACTION,
            expand_ratio: DEFAULT_PLATE_EXPAND_RATIO,
        }
    }
}

impl PlateCropConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.30..=0.40).contains(&self.height_fraction) {
            return Err(anyhow!(
                "plate height_fraction must be within [0.30, 0.40], got {}",
                self.height_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.expand_ratio) {
            return Err(anyhow!(
                "plate expand_ratio must be within [0, 1], got {}",
                self.expand_ratio
            ));
        }
        Ok(())
    }
}

/// Region likely to contain the plate: the bottom band of the box, widened
/// horizontally and clamped to the frame. `None` when nothing is left.
pub fn plate_region(
    bbox: &BoundingBox,
    frame_width: u32,
    frame_height: u32,
    crop: &PlateCropConfig,
) -> Option<PixelRect> {
    let (fw, fh) = (frame_width as f32, frame_height as f32);
    let bw = bbox.width();
    let bh = bbox.height();
    if !(bw > 0.0 && bh > 0.0) {
        return None;
    }

    let expand = bw * crop.expand_ratio;
    let left = (bbox.x1 - expand).clamp(0.0, fw).floor();
    let right = (bbox.x2 + expand).clamp(0.0, fw).ceil();
    let top = (bbox.y2 - bh * crop.height_fraction).clamp(0.0, fh).floor();
    let bottom = bbox.y2.clamp(0.0, fh).ceil();

    let rect = PixelRect {
        x: left as u32,
        y: top as u32,
        width: (right - left).max(0.0) as u32,
        height: (bottom - top).max(0.0) as u32,
    };
    if rect.is_empty() {
        None
    } else {
        Some(rect)
    }
}

/// Cut the plate region for `bbox` out of `frame`.
pub fn crop_plate(frame: &Frame, bbox: &BoundingBox, crop: &PlateCropConfig) -> Result<PlateImage> {
    let rect = plate_region(bbox, frame.width, frame.height, crop)
        .ok_or_else(|| anyhow!("plate region is empty for box {:?}", bbox))?;
    frame.crop(rect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bottom_band_widened_by_ratio() {
        let bbox = BoundingBox::new(100.0, 100.0, 200.0, 200.0);
        let rect = plate_region(&bbox, 1000, 1000, &PlateCropConfig::default()).unwrap();
        assert_eq!(
            rect,
            PixelRect {
                x: 90,
                y: 165,
                width: 120,
                height: 35
            }
        );
    }

    #[test]
    fn region_is_clamped_to_frame() {
        let bbox = BoundingBox::new(-20.0, 50.0, 60.0, 130.0);
        let rect = plate_region(&bbox, 100, 120, &PlateCropConfig::default()).unwrap();
        assert_eq!(rect.x, 0);
        assert_eq!(rect.x + rect.width, 68);
        assert_eq!(rect.y + rect.height, 120);
    }

    #[test]
    fn box_outside_frame_has_no_region() {
        let bbox = BoundingBox::new(500.0, 500.0, 600.0, 600.0);
        assert!(plate_region(&bbox, 100, 100, &PlateCropConfig::default()).is_none());
        let flat = BoundingBox::new(10.0, 10.0, 10.0, 50.0);
        assert!(plate_region(&flat, 100, 100, &PlateCropConfig::default()).is_none());
    }

    #[test]
    fn crop_fraction_is_bounded() {
        let crop = PlateCropConfig {
            height_fraction: 0.5,
            ..PlateCropConfig::default()
        };
        assert!(crop.validate().is_err());
        assert!(PlateCropConfig::default().validate().is_ok());
    }
}
