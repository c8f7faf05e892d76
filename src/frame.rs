//! Frame and geometry primitives shared by every stage.
//!
//! - `Frame`: one decoded RGB8 video frame, identified by its index in the stream.
//! - `BoundingBox`: pixel-space `xyxy` box as reported by the tracker.
//! - `PixelRect` / `PlateImage`: integer crop regions and the pixels cut from them.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Bytes per pixel for packed RGB8.
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Packed RGB8 frame. Pixel data is private; stages read it through `crop`.
#[derive(Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Frame {
    pub fn new(frame_id: u64, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(anyhow!(
                "frame {} has {} bytes, expected {} for {}x{} rgb8",
                frame_id,
                data.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            frame_id,
            width,
            height,
            data,
        })
    }

    /// All-black frame, used by synthetic sources.
    pub fn blank(frame_id: u64, width: u32, height: u32) -> Self {
        Self {
            frame_id,
            width,
            height,
            data: vec![0; width as usize * height as usize * CHANNELS],
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    /// Paint a region with a solid color. Out-of-frame parts are ignored.
    pub fn fill(&mut self, rect: PixelRect, rgb: [u8; 3]) {
        let x_end = rect.x.saturating_add(rect.width).min(self.width);
        let y_end = rect.y.saturating_add(rect.height).min(self.height);
        for y in rect.y..y_end {
            for x in rect.x..x_end {
                let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
                self.data[i..i + CHANNELS].copy_from_slice(&rgb);
            }
        }
    }

    /// Copy a region out of the frame. The region must already be clamped.
    pub fn crop(&self, rect: PixelRect) -> Result<PlateImage> {
        if rect.is_empty() {
            return Err(anyhow!("crop region is empty"));
        }
        if rect.x + rect.width > self.width || rect.y + rect.height > self.height {
            return Err(anyhow!(
                "crop region {:?} exceeds frame {}x{}",
                rect,
                self.width,
                self.height
            ));
        }
        let row_bytes = rect.width as usize * CHANNELS;
        let mut data = Vec::with_capacity(row_bytes * rect.height as usize);
        for y in rect.y..rect.y + rect.height {
            let start = (y as usize * self.width as usize + rect.x as usize) * CHANNELS;
            data.extend_from_slice(&self.data[start..start + row_bytes]);
        }
        Ok(PlateImage {
            width: rect.width,
            height: rect.height,
            data,
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("frame_id", &self.frame_id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Geometry
// ----------------------------------------------------------------------------

/// Pixel-space bounding box, top-left `(x1, y1)` to bottom-right `(x2, y2)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Anchor point used for position tracking: bottom-center.
    pub fn bottom_center(&self) -> [f64; 2] {
        [((self.x1 + self.x2) / 2.0) as f64, self.y2 as f64]
    }
}

/// Integer region inside a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

// ----------------------------------------------------------------------------
// PlateImage
// ----------------------------------------------------------------------------

/// RGB8 pixels cut from a frame for plate recognition.
#[derive(Clone, PartialEq, Eq)]
pub struct PlateImage {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl PlateImage {
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[i], self.data[i + 1], self.data[i + 2]])
    }

    pub fn center_pixel(&self) -> Option<[u8; 3]> {
        self.pixel(self.width / 2, self.height / 2)
    }

    /// Encode as JPEG for transport to remote recognizers.
    #[cfg(feature = "images")]
    pub fn to_jpeg(&self) -> Result<Vec<u8>> {
        let img = image::RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("plate image buffer does not match its dimensions"))?;
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img).write_to(&mut out, image::ImageFormat::Jpeg)?;
        Ok(out.into_inner())
    }
}

impl std::fmt::Debug for PlateImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlateImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
