//! Still images posing as a camera, for offline runs.
//!
use std::path::Path;

use common::frame::{Frame, FrameSource};

use crate::Error;

/// Frame source repeating the same picture on every capture.
pub struct StillImageSource {
    frame: Frame,
}

impl StillImageSource {
    pub fn new(frame: Frame) -> Self {
        Self { frame }
    }

    /// Load a picture from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let image = image::open(path)?.to_rgba8();
        log::info!(
            "Using still image {} ({}x{})",
            path.display(),
            image.width(),
            image.height()
        );

        Ok(Self::new(Frame::new(image)))
    }
}

impl FrameSource for StillImageSource {
    fn dimensions(&self) -> Option<(u32, u32)> {
        match self.frame.is_empty() {
            true => None,
            false => Some(self.frame.dimensions()),
        }
    }

    fn capture(&mut self) -> Result<Frame, Error> {
        Ok(self.frame.clone())
    }
}
