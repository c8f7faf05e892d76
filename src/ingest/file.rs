//! Local file frame source.

use anyhow::{anyhow, Result};

#[cfg(feature = "images")]
use super::image_dir::ImageDirSource;
use super::FrameSource;
use crate::frame::Frame;

const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 480;

#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    /// `stub://WIDTHxHEIGHT` or a local directory of frames.
    pub path: String,
    /// Stop after this many frames. Synthetic sources never end without it.
    pub max_frames: Option<u64>,
}

pub struct FileSource {
    backend: FileBackend,
    max_frames: Option<u64>,
    frames_captured: u64,
    path: String,
}

enum FileBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "images")]
    ImageDir(ImageDirSource),
}

impl FileSource {
    pub fn new(config: FileConfig) -> Result<Self> {
        if !is_local_file_path(&config.path) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes)"
            ));
        }
        let backend = if let Some(spec) = config.path.strip_prefix("stub://") {
            let (width, height) = parse_stub_dimensions(spec)?;
            FileBackend::Synthetic(SyntheticSource { width, height })
        } else {
            #[cfg(feature = "images")]
            {
                FileBackend::ImageDir(ImageDirSource::open(std::path::Path::new(&config.path))?)
            }
            #[cfg(not(feature = "images"))]
            {
                return Err(anyhow!("image directory ingestion requires the images feature"));
            }
        };
        log::info!("FileSource: opened {}", config.path);
        Ok(Self {
            backend,
            max_frames: config.max_frames,
            frames_captured: 0,
            path: config.path,
        })
    }

    pub fn stats(&self) -> FileStats {
        FileStats {
            frames_captured: self.frames_captured,
            path: self.path.clone(),
        }
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.max_frames.is_some_and(|max| self.frames_captured >= max) {
            return Ok(None);
        }
        let frame_id = self.frames_captured;
        let frame = match &mut self.backend {
            FileBackend::Synthetic(source) => Some(source.frame(frame_id)),
            #[cfg(feature = "images")]
            FileBackend::ImageDir(source) => source.next_frame(frame_id)?,
        };
        if frame.is_some() {
            self.frames_captured += 1;
        }
        Ok(frame)
    }
}

#[derive(Clone, Debug)]
pub struct FileStats {
    pub frames_captured: u64,
    pub path: String,
}

struct SyntheticSource {
    width: u32,
    height: u32,
}

impl SyntheticSource {
    fn frame(&self, frame_id: u64) -> Frame {
        Frame::blank(frame_id, self.width, self.height)
    }
}

fn parse_stub_dimensions(spec: &str) -> Result<(u32, u32)> {
    let Some((w, h)) = spec.split_once('x') else {
        return Ok((DEFAULT_STUB_WIDTH, DEFAULT_STUB_HEIGHT));
    };
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid stub frame width {:?}", w))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid stub frame height {:?}", h))?;
    if width == 0 || height == 0 {
        return Err(anyhow!("stub frame dimensions must be non-zero"));
    }
    Ok((width, height))
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
