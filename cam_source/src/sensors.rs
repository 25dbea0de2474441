//! Sensors module.
//!
use common::frame::{Frame, FrameSource};
use image::Rgb;
use rscam::{Camera, Config};
use simple_error::simple_error;

use crate::Error;

/// Only motion-JPEG streams are decoded.
const FORMAT: &str = "MJPG";

/// V4L2 camera delivering decoded frames.
pub struct CameraSource {
    cam: Camera,
    device_name: String,
    resolution: (u32, u32),
}

impl CameraSource {
    /// Open and start a video device on a Linux machine.
    ///
    /// Without explicit values, the highest supported resolution and frame rate are used.
    pub fn open(
        device_name: &str,
        resolution: Option<(u32, u32)>,
        frame_rate: Option<(u32, u32)>,
    ) -> Result<Self, Error> {
        let mut cam = Camera::new(device_name)?;
        log_supported_formats(&cam, FORMAT);
        let format = FORMAT.as_bytes();

        let resolution = resolution
            .map(Ok)
            .unwrap_or_else(|| get_max_resolution(&cam, format))?;

        let frame_rate = frame_rate
            .map(Ok)
            .unwrap_or_else(|| get_max_frame_rate(&cam, format, resolution))?;

        cam.start(&Config {
            interval: frame_rate,
            resolution,
            format,
            ..Default::default()
        })?;

        log::info!(
            "Using camera {} at {}x{}, interval {}/{}",
            device_name,
            resolution.0,
            resolution.1,
            frame_rate.0,
            frame_rate.1
        );

        Ok(Self {
            cam,
            device_name: device_name.to_owned(),
            resolution,
        })
    }
}

impl FrameSource for CameraSource {
    fn dimensions(&self) -> Option<(u32, u32)> {
        Some(self.resolution)
    }

    fn capture(&mut self) -> Result<Frame, Error> {
        let raw = self.cam.capture()?;
        let image = turbojpeg::decompress_image::<Rgb<u8>>(&raw[..])?;
        log::debug!(
            "Captured {}x{} frame from {} ({} bytes)",
            image.width(),
            image.height(),
            self.device_name,
            raw.len()
        );

        Ok(Frame::from_rgb(image))
    }
}

/// Get the maximum supported resolution for the given format.
fn get_max_resolution(cam: &Camera, format: &[u8]) -> Result<(u32, u32), Error> {
    let resolution_info = cam.resolutions(format)?;
    log::debug!("Found resolutions: {:?}", &resolution_info);
    match resolution_info {
        rscam::ResolutionInfo::Discretes(resolutions) => resolutions
            .iter()
            // Map to iterator over ((width, height) num_pixels)
            .map(|res| (res, res.0 * res.1))
            .max_by(|a, b| a.1.cmp(&b.1))
            .map(|res| *res.0),
        rscam::ResolutionInfo::Stepwise {
            min: _,
            max,
            step: _,
        } => Some(max),
    }
    .ok_or_else(|| simple_error!("No resolution found").into())
}

/// Get the maximum supported frame rate for the given format and resolution.
fn get_max_frame_rate(
    cam: &Camera,
    format: &[u8],
    resolution: (u32, u32),
) -> Result<(u32, u32), Error> {
    let interval_info = cam.intervals(format, resolution)?;
    log::debug!("Found frame rates: {:?}", &interval_info);
    match interval_info {
        // Intervals are frame durations, the shortest one is the highest frame rate
        rscam::IntervalInfo::Discretes(intervals) => intervals
            .iter()
            .min_by(|a, b| (a.0 * b.1).cmp(&(b.0 * a.1)))
            .copied(),
        rscam::IntervalInfo::Stepwise {
            min,
            max: _,
            step: _,
        } => Some(min),
    }
    .ok_or_else(|| simple_error!("No frame rate found").into())
}

fn log_supported_formats(cam: &Camera, format: &str) {
    let formats: Vec<_> = cam.formats().filter_map(|fmt| fmt.ok()).collect();
    log::debug!(
        "Supported formats: {:?}, using format {:?}",
        formats,
        format
    );
}
