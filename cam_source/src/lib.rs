//! Frame sources feeding the viewfinder pipeline.
pub mod sensors;
pub mod still;

pub use common::Error;
