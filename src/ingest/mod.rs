//! Frame ingestion sources.
//!
//! - Synthetic blank frames (`stub://WIDTHxHEIGHT`), for tests and dry runs
//! - A directory of JPEG/PNG frames decoded in file-name order (feature: images)
//!
//! Sources number frames from 0 in capture order; the pipeline derives
//! timestamps from that index and the configured fps.

pub mod file;
#[cfg(feature = "images")]
pub(crate) mod image_dir;

use anyhow::Result;

use crate::frame::Frame;

pub use file::{FileConfig, FileSource, FileStats};

pub trait FrameSource {
    /// `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}
