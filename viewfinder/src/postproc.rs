//! Interpretation of raw model outputs.
//!
use tract_onnx::prelude::Tensor;

use crate::{
    config::{DetectorConfig, HeadConfig, PipelineConfig, ScoreFormula},
    Result, ScanError,
};

/// Accepted detector record.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    /// `[x_top_left, y_top_left, width, height]`, normalized to the model input.
    pub bbox: [f32; 4],
}

/// Result of the single-logit classifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Classification {
    pub logit: f32,
    pub score: f32,
    pub detected: bool,
}

/// Postprocessed model output of one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inference {
    Classification(Classification),
    Detections(Vec<Detection>),
}

impl Inference {
    /// Detections of the frame, empty for classifiers.
    pub fn detections(&self) -> &[Detection] {
        match self {
            Inference::Classification(_) => &[],
            Inference::Detections(detections) => detections,
        }
    }
}

/// Logistic function.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Squash a logit and compare it against `threshold`.
pub fn classify(logit: f32, threshold: f32) -> Classification {
    let score = sigmoid(logit);
    Classification {
        logit,
        score,
        detected: score > threshold,
    }
}

/// Filter detector records.
///
/// `values` is a flat sequence of records `[cx, cy, w, h, objectness,
/// class_confidence, ..]` of `record_width` values each. A record is accepted
/// if it clears the objectness floor, the class confidence floor (if any) and
/// its area lies strictly inside the area band. Raw detector output is noisy at
/// low confidence and degenerate tiny or frame-filling boxes are not real hits.
pub fn detect(values: &[f32], config: &DetectorConfig) -> Vec<Detection> {
    if config.record_width < 6 {
        log::warn!("Records of width {} carry no box", config.record_width);
        return vec![];
    }

    let records = values.chunks_exact(config.record_width);
    if !records.remainder().is_empty() {
        log::warn!(
            "Ignoring {} trailing values not forming a record of width {}",
            records.remainder().len(),
            config.record_width
        );
    }

    records
        .filter_map(|record| {
            let (cx, cy, width, height) = (record[0], record[1], record[2], record[3]);
            let (objectness, class_confidence) = (record[4], record[5]);

            // NaN never clears a floor
            if !(objectness > config.objectness_floor) {
                return None;
            }
            if let Some(class_floor) = config.class_floor {
                if !(class_confidence > class_floor) {
                    return None;
                }
            }
            if !config.area.contains(width * height) {
                return None;
            }

            let score = match config.score_formula {
                ScoreFormula::Objectness => objectness,
                ScoreFormula::ObjectnessTimesClass => objectness * class_confidence,
            };

            Some(Detection {
                label: config.label.clone(),
                score,
                bbox: [cx - width / 2.0, cy - height / 2.0, width, height],
            })
        })
        .collect()
}

/// Turns output tensors into classifications or detections.
#[derive(Clone, Debug)]
pub struct Postprocessor {
    head: HeadConfig,
}

impl Postprocessor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            head: config.head.clone(),
        }
    }

    pub fn run(&self, output: &Tensor) -> Result<Inference> {
        let values = output
            .as_slice::<f32>()
            .map_err(|err| ScanError::Postprocess(format!("{err:#}")))?;

        match &self.head {
            HeadConfig::Classifier { threshold } => {
                let logit = values.first().ok_or_else(|| {
                    ScanError::Postprocess("classifier output is empty".to_owned())
                })?;
                let classification = classify(*logit, *threshold);
                log::debug!(
                    "Classifier score {:.4}, detected: {}",
                    classification.score,
                    classification.detected
                );

                Ok(Inference::Classification(classification))
            }
            HeadConfig::Detector(detector) => {
                let detections = detect(values, detector);
                log::debug!("Detections: {:?}", &detections);

                Ok(Inference::Detections(detections))
            }
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::config::{AreaBand, Preset};

    type Error = Box<dyn std::error::Error>;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-6, "{a} != {b}");
    }

    fn relaxed() -> DetectorConfig {
        match Preset::DetectorRelaxed.config().head {
            HeadConfig::Detector(detector) => detector,
            HeadConfig::Classifier { .. } => unreachable!(),
        }
    }

    fn strict() -> DetectorConfig {
        match Preset::Detector.config().head {
            HeadConfig::Detector(detector) => detector,
            HeadConfig::Classifier { .. } => unreachable!(),
        }
    }

    #[test]
    fn classifier_is_monotonic() {
        let logits = [-8.0, -2.0, -0.1, 0.0, 0.1, 2.0, 8.0];
        for pair in logits.windows(2) {
            assert!(classify(pair[0], 0.5).score < classify(pair[1], 0.5).score);
        }
    }

    #[test]
    fn classifier_fires_above_zero_logit() {
        assert!(!classify(-0.5, 0.5).detected);
        assert!(!classify(0.0, 0.5).detected);
        assert!(classify(0.5, 0.5).detected);

        let classification = classify(2.0, 0.5);
        assert!((classification.score - 0.8808).abs() < 1e-4);
        assert!(classification.detected);
    }

    #[test]
    fn converts_center_to_top_left() {
        let detections = detect(&[0.5, 0.5, 0.2, 0.2, 0.9, 1.0], &relaxed());

        assert_eq!(detections.len(), 1);
        let bbox = detections[0].bbox;
        for (value, expected) in bbox.iter().zip([0.4, 0.4, 0.2, 0.2]) {
            assert_close(*value, expected);
        }
        assert_eq!(detections[0].label, "ECOQCODE");
        assert_eq!(detections[0].score, 0.9);
    }

    #[test]
    fn area_band_rejects_confident_records() {
        let mut config = relaxed();
        config.area = AreaBand { min: 0.25, max: 0.5 };

        let records = [
            // area 0.25, exactly at the lower bound
            0.5, 0.5, 0.5, 0.5, 0.99, 0.99, //
            // area 0.5, exactly at the upper bound
            0.5, 0.5, 1.0, 0.5, 0.99, 0.99, //
            // area 0.0001, tiny
            0.5, 0.5, 0.01, 0.01, 0.99, 0.99, //
            // area 1.0, full frame
            0.5, 0.5, 1.0, 1.0, 0.99, 0.99, //
            // area 0.375, inside
            0.5, 0.5, 0.75, 0.5, 0.99, 0.99,
        ];
        let detections = detect(&records, &config);

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].bbox[2], 0.75);
    }

    #[test]
    fn dual_threshold_gating() {
        let config = strict();
        let records = [
            // objectness at the floor
            0.5, 0.5, 0.1, 0.1, 0.5, 0.9, //
            // class confidence too low
            0.5, 0.5, 0.1, 0.1, 0.9, 0.8, //
            // accepted
            0.5, 0.5, 0.1, 0.1, 0.9, 0.9,
        ];
        let detections = detect(&records, &config);

        assert_eq!(detections.len(), 1);
        assert_close(detections[0].score, 0.81);
    }

    #[test]
    fn single_class_ignores_class_confidence() {
        let detections = detect(&[0.5, 0.5, 0.1, 0.1, 0.45, 0.0], &relaxed());

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].score, 0.45);
    }

    #[test]
    fn trailing_partial_record_is_ignored() {
        let detections = detect(&[0.5, 0.5, 0.1, 0.1, 0.9, 0.9, 0.5, 0.5], &strict());

        assert_eq!(detections.len(), 1);
    }

    #[test]
    fn nan_confidences_are_rejected() {
        let nan = f32::NAN;
        assert!(detect(&[0.5, 0.5, 0.1, 0.1, nan, nan], &relaxed()).is_empty());
        assert!(detect(&[0.5, 0.5, 0.1, 0.1, nan, 0.9], &strict()).is_empty());
        assert!(detect(&[0.5, 0.5, 0.1, 0.1, 0.9, nan], &strict()).is_empty());
        assert!(detect(&[nan, nan, nan, nan, 0.9, 0.9], &strict()).is_empty());
    }

    #[test]
    fn wider_records() {
        let mut config = relaxed();
        config.record_width = 7;

        let records = [
            0.5, 0.5, 0.1, 0.1, 0.9, 0.9, 42.0, //
            0.2, 0.2, 0.1, 0.1, 0.1, 0.9, 42.0,
        ];
        assert_eq!(detect(&records, &config).len(), 1);
    }

    #[test]
    fn postprocess_tensors() -> Result<(), Error> {
        let classifier = Postprocessor::new(&Preset::Classifier.config());
        let output = Tensor::from_shape(&[1, 1], &[2.0f32])?;
        match classifier.run(&output)? {
            Inference::Classification(classification) => assert!(classification.detected),
            other => panic!("unexpected {other:?}"),
        }

        let detector = Postprocessor::new(&Preset::Detector.config());
        let output = Tensor::from_shape(&[1, 2, 6], &[0.0f32; 12])?;
        assert_eq!(detector.run(&output)?, Inference::Detections(vec![]));

        Ok(())
    }

    #[test]
    fn unexpected_outputs() -> Result<(), Error> {
        let classifier = Postprocessor::new(&Preset::Classifier.config());

        let empty = Tensor::from_shape::<f32>(&[1, 0], &[])?;
        assert!(matches!(
            classifier.run(&empty),
            Err(ScanError::Postprocess(_))
        ));

        let integers = Tensor::from_shape(&[1], &[3i64])?;
        assert!(matches!(
            classifier.run(&integers),
            Err(ScanError::Postprocess(_))
        ));

        Ok(())
    }
}
