//! Frame snapshots and the sources producing them.
//!
use image::{DynamicImage, Rgba, RgbaImage, RgbImage};

use crate::Error;

/// Immutable snapshot of a camera frame with RGBA pixel layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    image: RgbaImage,
}

impl Frame {
    /// Create a new frame from RGBA pixel data.
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    /// Create a frame from an RGB image, with an opaque alpha channel.
    pub fn from_rgb(image: RgbImage) -> Self {
        Self {
            image: DynamicImage::ImageRgb8(image).into_rgba8(),
        }
    }

    /// Create a frame filled with a single color.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        Self {
            image: RgbaImage::from_pixel(width, height, Rgba(rgba)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// A frame without pixels, e.g. from a stream that has not reported its size yet.
    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn as_image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }
}

/// Source of frames, e.g. a camera.
pub trait FrameSource {
    /// Native resolution of the source, `None` as long as it is not known yet.
    fn dimensions(&self) -> Option<(u32, u32)>;

    /// Capture the current frame.
    fn capture(&mut self) -> Result<Frame, Error>;
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn from_rgb_is_opaque() {
        let frame = Frame::from_rgb(RgbImage::from_pixel(4, 2, image::Rgb([10, 20, 30])));

        assert_eq!(frame.dimensions(), (4, 2));
        assert!(frame
            .as_image()
            .pixels()
            .all(|px| *px == Rgba([10, 20, 30, 255])));
    }

    #[test]
    fn empty_frames() {
        assert!(Frame::filled(0, 480, [0; 4]).is_empty());
        assert!(Frame::filled(640, 0, [0; 4]).is_empty());
        assert!(!Frame::filled(1, 1, [0; 4]).is_empty());
    }
}
