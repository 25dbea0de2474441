//! Common code shared between `viewfinder` and `cam_source`.
pub mod frame;

/// Error type.
pub type Error = Box<dyn std::error::Error + Send + Sync>;
