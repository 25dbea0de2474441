//! Conversion of camera frames into model input tensors.
//!
use common::frame::Frame;
use image::{imageops::FilterType, RgbaImage};
use tract_onnx::prelude::{tract_ndarray, Tensor};

use crate::{
    config::{CropPolicy, NormalizationMode, PipelineConfig},
    Result, ScanError,
};

/// Frame size assumed by fixed crops while the source has not reported its own.
pub const DEFAULT_FRAME_DIMENSIONS: (u32, u32) = (640, 480);

/// Square region of a frame in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub size: u32,
}

/// Compute the region of a frame of size `frame_dims` to feed to the model.
pub fn crop_rect(policy: CropPolicy, frame_dims: (u32, u32)) -> Result<CropRect> {
    let (width, height) = frame_dims;

    let (width, height, size) = match policy {
        CropPolicy::CenterSquare => {
            if width == 0 || height == 0 {
                return Err(ScanError::InvalidFrame(format!(
                    "no centered square in a {width}x{height} frame"
                )));
            }
            (width, height, width.min(height))
        }
        CropPolicy::FixedCenter { crop } => {
            let (width, height) = match width == 0 || height == 0 {
                true => DEFAULT_FRAME_DIMENSIONS,
                false => (width, height),
            };
            if crop == 0 || crop > width || crop > height {
                return Err(ScanError::InvalidFrame(format!(
                    "cannot crop {crop}x{crop} from a {width}x{height} frame"
                )));
            }
            (width, height, crop)
        }
    };

    Ok(CropRect {
        x: (width - size) / 2,
        y: (height - size) / 2,
        size,
    })
}

/// Crops, resizes and normalizes frames into `[1, 3, S, S]` tensors.
#[derive(Clone, Debug)]
pub struct Preprocessor {
    input_size: u32,
    crop: CropPolicy,
    normalization: NormalizationMode,
}

impl Preprocessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            input_size: config.input_size,
            crop: config.crop,
            normalization: config.normalization,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Region of `frame` fed to the model.
    pub fn crop_rect(&self, frame: &Frame) -> Result<CropRect> {
        let rect = crop_rect(self.crop, frame.dimensions())?;
        if rect.x + rect.size > frame.width() || rect.y + rect.size > frame.height() {
            return Err(ScanError::InvalidFrame(format!(
                "crop {rect:?} exceeds the {}x{} frame",
                frame.width(),
                frame.height()
            )));
        }

        Ok(rect)
    }

    /// Build the model input from a frame.
    ///
    /// The tensor is channel-planar: all red values in row-major order, then all
    /// green values, then all blue values. Alpha is dropped. Returns the
    /// tensor with the frame region it was built from.
    pub fn run(&self, frame: &Frame) -> Result<(Tensor, CropRect)> {
        let rect = self.crop_rect(frame)?;
        let cropped =
            image::imageops::crop_imm(frame.as_image(), rect.x, rect.y, rect.size, rect.size)
                .to_image();
        let resized: RgbaImage = image::imageops::resize(
            &cropped,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );

        let size = self.input_size as usize;
        let normalization = self.normalization;
        let tensor: Tensor =
            tract_ndarray::Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
                normalization.apply(resized[(x as _, y as _)][c])
            })
            .into();

        Ok((tensor, rect))
    }
}
