//! Viewfinder binary.
//!
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Result};
use cam_source::{sensors::CameraSource, still::StillImageSource};
use clap::Parser;
use common::frame::{Frame, FrameSource};
use env_logger::TimestampPrecision;
use image::RgbaImage;
use viewfinder::{
    config::{AlertPolicy, HeadConfig, PipelineConfig, Preset},
    frame_loop::{display_ticker, Cycle, FrameLoop},
    meter::spawn_meter_logger,
    overlay::{composite, LogBanner},
    session::TractSession,
    ScanError,
};

#[derive(Parser, Debug)]
#[clap(author, version)]
struct Args {
    /// Deployment the model was trained for
    #[clap(long, value_enum, default_value = "classifier")]
    preset: Preset,

    /// Path of the ONNX model
    #[clap(long)]
    model: PathBuf,

    /// Video device to capture from
    #[clap(long, default_value = "/dev/video0")]
    device: String,

    /// Capture resolution as WIDTHxHEIGHT, the highest supported one if omitted
    #[clap(long, value_parser = parse_resolution)]
    resolution: Option<(u32, u32)>,

    /// Picture to run on instead of the camera
    #[clap(long)]
    image: Option<PathBuf>,

    /// Cycles per second
    #[clap(long, default_value_t = 30.0)]
    tick_rate: f32,

    /// Abandon inference calls taking longer than this many milliseconds
    #[clap(long)]
    watchdog_ms: Option<u64>,

    /// JPEG file rewritten with the camera picture and overlay of every frame
    #[clap(long)]
    preview: Option<PathBuf>,

    /// Classifier score threshold
    #[clap(long)]
    threshold: Option<f32>,

    /// Minimum detector objectness
    #[clap(long)]
    objectness_floor: Option<f32>,

    /// Minimum detector class confidence
    #[clap(long)]
    class_floor: Option<f32>,

    /// Smallest accepted normalized box area (exclusive)
    #[clap(long)]
    area_min: Option<f32>,

    /// Largest accepted normalized box area (exclusive)
    #[clap(long)]
    area_max: Option<f32>,

    /// Number of confident detections raising the alert
    #[clap(long)]
    min_count: Option<usize>,

    /// Viewfinder cutout edge as fraction of the shorter picture side
    #[clap(long)]
    mask_size: Option<f32>,

    /// Vertical shift of the cutout as fraction of the picture height
    #[clap(long, allow_hyphen_values = true)]
    mask_offset: Option<f32>,

    /// Draw boxes around detections
    #[clap(long)]
    draw_boxes: bool,
}

impl Args {
    /// Preset configuration with the overrides given on the command line.
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = self.preset.config();

        match &mut config.head {
            HeadConfig::Classifier { threshold } => {
                if let Some(value) = self.threshold {
                    *threshold = value;
                }
            }
            HeadConfig::Detector(detector) => {
                if let Some(value) = self.objectness_floor {
                    detector.objectness_floor = value;
                }
                if let Some(value) = self.class_floor {
                    detector.class_floor = Some(value);
                }
                if let Some(value) = self.area_min {
                    detector.area.min = value;
                }
                if let Some(value) = self.area_max {
                    detector.area.max = value;
                }
            }
        }

        if let (AlertPolicy::MinCount { min_count, .. }, Some(value)) =
            (&mut config.alert, self.min_count)
        {
            *min_count = value;
        }

        if let Some(value) = self.mask_size {
            config.mask.size_fraction = value;
        }
        if let Some(value) = self.mask_offset {
            config.mask.vertical_offset = value;
        }
        config.mask.draw_boxes |= self.draw_boxes;

        config
    }
}

fn parse_resolution(value: &str) -> Result<(u32, u32), String> {
    let (width, height) = value
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {value}"))?;
    let parse = |side: &str| side.parse::<u32>().map_err(|err| format!("{side}: {err}"));

    Ok((parse(width)?, parse(height)?))
}

/// Camera or still picture.
enum Source {
    Camera(CameraSource),
    Still(StillImageSource),
}

impl FrameSource for Source {
    fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Source::Camera(camera) => camera.dimensions(),
            Source::Still(still) => still.dimensions(),
        }
    }

    fn capture(&mut self) -> Result<Frame, common::Error> {
        match self {
            Source::Camera(camera) => camera.capture(),
            Source::Still(still) => still.capture(),
        }
    }
}

fn write_preview(path: &Path, frame: &Frame, surface: &RgbaImage) -> Result<()> {
    let picture = composite(frame, surface);
    let buf = turbojpeg::compress_image(&picture, 95, turbojpeg::Subsamp::Sub2x2)?;
    std::fs::write(path, &buf[..])?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logger
    env_logger::builder()
        .format_timestamp(Some(TimestampPrecision::Millis))
        .init();

    let config = args.pipeline_config();
    config.validate()?;
    if !(args.tick_rate > 0.0 && args.tick_rate.is_finite()) {
        bail!("tick rate must be positive, got {}", args.tick_rate);
    }

    // Camera and model are required, failing to get either ends the program
    let source = match &args.image {
        Some(path) => Source::Still(StillImageSource::open(path).map_err(ScanError::Acquisition)?),
        None => Source::Camera(
            CameraSource::open(&args.device, args.resolution, None)
                .map_err(ScanError::Acquisition)?,
        ),
    };
    let session = TractSession::load(&args.model, config.input_size)?;

    let mut frame_loop: FrameLoop<Source, TractSession> =
        FrameLoop::new(&config).with_signal(Box::new(LogBanner::default()));
    if let Some(watchdog_ms) = args.watchdog_ms {
        frame_loop = frame_loop.with_watchdog(Duration::from_millis(watchdog_ms));
    }
    frame_loop.attach_source(source);
    frame_loop.attach_session(session);

    spawn_meter_logger(Duration::from_secs(2));

    let mut ticker = display_ticker(args.tick_rate);
    let preview = args.preview.as_ref();
    let run = frame_loop.run(&mut ticker, |frame_loop, cycle| {
        if let (Some(path), Cycle::Rendered { frame, .. }, Some(surface)) =
            (preview, &cycle, frame_loop.surface())
        {
            if let Err(err) = write_preview(path, frame, surface) {
                log::warn!("Failed to write preview {}: {err:#}", path.display());
            }
        }
    });

    tokio::select! {
        _ = run => {}
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }

    Ok(())
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn resolutions() {
        assert_eq!(parse_resolution("1280x720"), Ok((1280, 720)));
        assert!(parse_resolution("1280").is_err());
        assert!(parse_resolution("wide x720").is_err());
    }

    #[test]
    fn overrides() {
        let args = Args::parse_from([
            "viewfinder",
            "--preset",
            "detector",
            "--model",
            "model.onnx",
            "--min-count",
            "1",
            "--area-max",
            "0.9",
            "--mask-offset",
            "-0.2",
        ]);
        let config = args.pipeline_config();

        assert_eq!(
            config.alert,
            AlertPolicy::MinCount {
                min_count: 1,
                score_floor: 0.5
            }
        );
        match &config.head {
            HeadConfig::Detector(detector) => assert_eq!(detector.area.max, 0.9),
            other => panic!("unexpected head {other:?}"),
        }
        assert_eq!(config.mask.vertical_offset, -0.2);
        assert!(config.validate().is_ok());
    }
}
