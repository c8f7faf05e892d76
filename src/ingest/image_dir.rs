use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::frame::Frame;

/// Still frames from a directory, decoded lazily in file-name order.
pub(crate) struct ImageDirSource {
    files: Vec<PathBuf>,
    cursor: usize,
}

impl ImageDirSource {
    pub(crate) fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| anyhow!("failed to read frame directory {}: {}", dir.display(), e))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_frame = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
                .unwrap_or(false);
            if is_frame {
                files.push(path);
            }
        }
        files.sort();
        if files.is_empty() {
            return Err(anyhow!("no JPEG or PNG frames in {}", dir.display()));
        }
        log::debug!("image directory {}: {} frame(s)", dir.display(), files.len());
        Ok(Self { files, cursor: 0 })
    }

    pub(crate) fn next_frame(&mut self, frame_id: u64) -> Result<Option<Frame>> {
        let Some(path) = self.files.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        let rgb = image::open(path)
            .map_err(|e| anyhow!("failed to decode frame {}: {}", path.display(), e))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        Frame::new(frame_id, width, height, rgb.into_raw()).map(Some)
    }
}
