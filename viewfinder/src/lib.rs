//! Run a classifier or detector on a camera stream and draw a viewfinder overlay.
//!
//! Every display tick, the [`frame_loop::FrameLoop`] takes one frame through
//! preprocessing, inference, postprocessing and rendering.
pub mod config;
pub mod error;
pub mod frame_loop;
pub mod meter;
pub mod overlay;
pub mod postproc;
pub mod preproc;
pub mod session;

pub use error::ScanError;

/// Result type of the pipeline stages.
pub type Result<T, E = ScanError> = std::result::Result<T, E>;
