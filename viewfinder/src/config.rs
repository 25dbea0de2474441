//! Configuration of the pipeline.
//!
//! One [`PipelineConfig`] describes a whole deployment: how frames are cropped
//! and normalized, how the model output is read, when the alert fires and
//! what the viewfinder mask looks like. [`Preset`] holds the known deployments.
use clap::ValueEnum;

use crate::{Result, ScanError};

/// Region of the frame that is fed to the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CropPolicy {
    /// Largest centered square of the frame.
    CenterSquare,
    /// Centered square of fixed edge length in pixels, independent of the frame size.
    FixedCenter { crop: u32 },
}

/// Mapping of 8-bit color values to model input values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizationMode {
    /// `v / 255 * 2 - 1`, range [-1, 1].
    Signed,
    /// `v / 255`, range [0, 1].
    Unsigned,
}

impl NormalizationMode {
    pub fn apply(self, value: u8) -> f32 {
        let unit = value as f32 / 255.0;
        match self {
            NormalizationMode::Signed => unit * 2.0 - 1.0,
            NormalizationMode::Unsigned => unit,
        }
    }

    /// Inclusive range of normalized values.
    pub fn range(self) -> (f32, f32) {
        match self {
            NormalizationMode::Signed => (-1.0, 1.0),
            NormalizationMode::Unsigned => (0.0, 1.0),
        }
    }
}

/// Score of a detector record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScoreFormula {
    /// Single-class models, the class confidence carries no information.
    Objectness,
    ObjectnessTimesClass,
}

/// Open interval of accepted normalized box areas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AreaBand {
    pub min: f32,
    pub max: f32,
}

impl AreaBand {
    /// Both bounds are exclusive.
    pub fn contains(&self, area: f32) -> bool {
        area > self.min && area < self.max
    }
}

/// Settings of the multi-box detector output.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Label of the single class the deployment knows.
    pub label: String,
    /// Number of values per record, at least
    /// `[cx, cy, w, h, objectness, class_confidence]`.
    pub record_width: usize,
    pub score_formula: ScoreFormula,
    pub objectness_floor: f32,
    /// Minimum class confidence, not checked when `None`.
    pub class_floor: Option<f32>,
    pub area: AreaBand,
}

/// Interpretation of the raw model output.
#[derive(Clone, Debug, PartialEq)]
pub enum HeadConfig {
    /// One logit, squashed with the logistic function and compared against `threshold`.
    Classifier { threshold: f32 },
    Detector(DetectorConfig),
}

/// Rule deriving the alert flag from a postprocessed frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlertPolicy {
    /// Alert iff the classifier fired.
    Classifier,
    /// Alert iff at least `min_count` detections score `score_floor` or more.
    MinCount { min_count: usize, score_floor: f32 },
    AnyDetection,
}

/// Geometry and style of the viewfinder mask.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskGeometry {
    /// Edge of the cutout as fraction of the shorter surface dimension.
    pub size_fraction: f32,
    /// Vertical shift of the cutout as fraction of the surface height.
    pub vertical_offset: f32,
    /// Opacity of the dark fill around the cutout.
    pub shade_alpha: f32,
    /// Width of the white cutout border in pixels, no border when `None`.
    pub stroke_width: Option<u32>,
    /// Draw hollow rectangles around detections.
    pub draw_boxes: bool,
}

impl Default for MaskGeometry {
    fn default() -> Self {
        Self {
            size_fraction: 0.6,
            vertical_offset: 0.0,
            shade_alpha: 0.75,
            stroke_width: Some(2),
            draw_boxes: false,
        }
    }
}

/// Canonical configuration shared by every stage in the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Name of the model input receiving the frame tensor.
    pub input_name: String,
    /// Edge length `S` of the square model input.
    pub input_size: u32,
    pub crop: CropPolicy,
    pub normalization: NormalizationMode,
    pub head: HeadConfig,
    pub alert: AlertPolicy,
    pub mask: MaskGeometry,
}

impl PipelineConfig {
    /// Check the configuration for values no deployment can work with.
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(config_error("input size must be positive"));
        }
        if self.crop == (CropPolicy::FixedCenter { crop: 0 }) {
            return Err(config_error("crop size must be positive"));
        }

        match (&self.head, self.alert) {
            (HeadConfig::Classifier { threshold }, AlertPolicy::Classifier) => {
                check_unit("classifier threshold", *threshold)?
            }
            (HeadConfig::Detector(detector), AlertPolicy::MinCount { score_floor, .. }) => {
                check_unit("alert score floor", score_floor)?;
                detector.validate()?
            }
            (HeadConfig::Detector(detector), AlertPolicy::AnyDetection) => detector.validate()?,
            (head, alert) => {
                return Err(config_error(&format!(
                    "alert policy {alert:?} does not fit head {head:?}"
                )))
            }
        }

        let mask = &self.mask;
        check_unit("mask size fraction", mask.size_fraction)?;
        check_unit("mask shade alpha", mask.shade_alpha)?;
        if !mask.vertical_offset.is_finite() {
            return Err(config_error("mask vertical offset must be finite"));
        }
        if mask.size_fraction == 0.0 {
            log::warn!("Mask size fraction is zero, the viewfinder will have no cutout");
        }

        Ok(())
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        if self.record_width < 6 {
            return Err(config_error(&format!(
                "detector records need at least 6 values, got {}",
                self.record_width
            )));
        }
        check_unit("objectness floor", self.objectness_floor)?;
        if let Some(class_floor) = self.class_floor {
            check_unit("class confidence floor", class_floor)?;
        }
        if !(self.area.min.is_finite() && self.area.max.is_finite())
            || self.area.min >= self.area.max
        {
            return Err(config_error(&format!(
                "area band [{}, {}] is empty",
                self.area.min, self.area.max
            )));
        }

        Ok(())
    }
}

/// Known deployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// Sigmoid classifier on the largest centered square.
    Classifier,
    /// Multi-class detector requiring three confident boxes.
    Detector,
    /// Single-class detector with relaxed thresholds.
    DetectorRelaxed,
}

/// Label of the one class all deployments detect.
pub const DEFAULT_LABEL: &str = "ECOQCODE";

impl Preset {
    pub fn config(self) -> PipelineConfig {
        match self {
            Preset::Classifier => PipelineConfig {
                input_name: "input".into(),
                input_size: 224,
                crop: CropPolicy::CenterSquare,
                normalization: NormalizationMode::Signed,
                head: HeadConfig::Classifier { threshold: 0.5 },
                alert: AlertPolicy::Classifier,
                mask: MaskGeometry::default(),
            },
            Preset::Detector => PipelineConfig {
                input_name: "images".into(),
                input_size: 640,
                crop: CropPolicy::FixedCenter { crop: 320 },
                normalization: NormalizationMode::Unsigned,
                head: HeadConfig::Detector(DetectorConfig {
                    label: DEFAULT_LABEL.into(),
                    record_width: 6,
                    score_formula: ScoreFormula::ObjectnessTimesClass,
                    objectness_floor: 0.5,
                    class_floor: Some(0.8),
                    area: AreaBand {
                        min: 0.001,
                        max: 0.5,
                    },
                }),
                alert: AlertPolicy::MinCount {
                    min_count: 3,
                    score_floor: 0.5,
                },
                mask: MaskGeometry {
                    shade_alpha: 0.6,
                    stroke_width: None,
                    ..MaskGeometry::default()
                },
            },
            Preset::DetectorRelaxed => PipelineConfig {
                input_name: "images".into(),
                input_size: 640,
                crop: CropPolicy::FixedCenter { crop: 320 },
                normalization: NormalizationMode::Unsigned,
                head: HeadConfig::Detector(DetectorConfig {
                    label: DEFAULT_LABEL.into(),
                    record_width: 6,
                    score_formula: ScoreFormula::Objectness,
                    objectness_floor: 0.4,
                    class_floor: None,
                    area: AreaBand {
                        min: 0.0003,
                        max: 0.6,
                    },
                }),
                alert: AlertPolicy::AnyDetection,
                mask: MaskGeometry {
                    vertical_offset: -0.1,
                    ..MaskGeometry::default()
                },
            },
        }
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    match (0.0..=1.0).contains(&value) {
        true => Ok(()),
        false => Err(config_error(&format!("{name} must be in [0, 1], got {value}"))),
    }
}

fn config_error(message: &str) -> ScanError {
    ScanError::Config(message.to_owned())
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn presets_are_valid() {
        for preset in Preset::value_variants() {
            assert!(preset.config().validate().is_ok(), "{preset:?}");
        }
    }

    #[test]
    fn normalization_ranges() {
        assert_eq!(NormalizationMode::Signed.apply(0), -1.0);
        assert_eq!(NormalizationMode::Signed.apply(255), 1.0);
        assert_eq!(NormalizationMode::Unsigned.apply(0), 0.0);
        assert_eq!(NormalizationMode::Unsigned.apply(255), 1.0);
    }

    #[test]
    fn area_band_is_exclusive() {
        let band = AreaBand { min: 0.25, max: 0.5 };
        assert!(!band.contains(0.25));
        assert!(band.contains(0.3));
        assert!(!band.contains(0.5));
    }

    #[test]
    fn rejects_short_records() {
        let mut config = Preset::Detector.config();
        if let HeadConfig::Detector(detector) = &mut config.head {
            detector.record_width = 5;
        }
        assert!(matches!(config.validate(), Err(ScanError::Config(_))));
    }

    #[test]
    fn rejects_inverted_area_band() {
        let mut config = Preset::DetectorRelaxed.config();
        if let HeadConfig::Detector(detector) = &mut config.head {
            detector.area = AreaBand { min: 0.6, max: 0.1 };
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_mismatched_alert_policy() {
        let mut config = Preset::Classifier.config();
        config.alert = AlertPolicy::AnyDetection;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_size_mask_is_allowed() {
        let mut config = Preset::Classifier.config();
        config.mask.size_fraction = 0.0;
        assert!(config.validate().is_ok());
    }
}
