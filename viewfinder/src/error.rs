//! Error taxonomy of the pipeline.
//!
//! `Acquisition` and `ModelLoad` are fatal at startup, everything else only
//! costs the current cycle.
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to acquire frame source: {0}")]
    Acquisition(common::Error),

    #[error("failed to load model {}: {message}", .path.display())]
    ModelLoad { path: PathBuf, message: String },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("unexpected model output: {0}")]
    Postprocess(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ScanError {
    /// Whether the error ends the program instead of a single cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ScanError::Acquisition(_) | ScanError::ModelLoad { .. } | ScanError::Config(_)
        )
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn startup_errors_are_fatal() {
        let missing = ScanError::ModelLoad {
            path: "model.onnx".into(),
            message: "not found".into(),
        };
        assert!(missing.is_fatal());
        assert_eq!(
            missing.to_string(),
            "failed to load model model.onnx: not found"
        );

        assert!(ScanError::Acquisition("permission denied".into()).is_fatal());
        assert!(!ScanError::InvalidFrame("0x0".into()).is_fatal());
        assert!(!ScanError::Inference("stalled".into()).is_fatal());
    }
}
