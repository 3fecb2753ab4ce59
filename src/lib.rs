//! BlazePalm-style palm detection with GPU-resident postprocessing.
//!
//! The heavy lifting happens in three `wgpu` compute passes: image
//! preprocessing, candidate aggregation (anchor decoding behind an atomic
//! append counter), and greedy overlap removal. The neural network itself is
//! an opaque [`nn::InferenceEngine`]; the shipped backend runs the ONNX model
//! with `tract`.
//!
//! Detections stay on the GPU: a renderer can consume
//! [`PalmDetector::detection_buffer`] together with indirect draw arguments
//! filled in by [`PalmDetector::sync_draw_count`], without any CPU round
//! trip. Host code that *does* want the data calls
//! [`PalmDetector::detections`], which performs a blocking readback and
//! caches the result until the next pipeline run.

use log::LevelFilter;

pub mod detection;
pub mod detector;
pub mod gpu;
pub mod image;
pub mod nn;
pub mod num;
pub mod preprocess;
pub mod timer;

pub use detection::{Detection, Keypoint, MAX_DETECTIONS};
pub use detector::{PalmDetector, Resources, ShaderSet};
pub use image::ImageFrame;

/// Errors produced by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller handed the pipeline a degenerate or mis-sized input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The model asset could not be loaded, or its tensor contract does not
    /// match what the pipeline expects.
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// The inference engine failed while running the model.
    #[error("inference failed: {0}")]
    Inference(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and this library will log at *debug* level, `wgpu` at
/// *warn* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
