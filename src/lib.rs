//! Real-time hand tracking on GPU-resident buffers.
//!
//! A [`HandPipeline`] takes one camera frame per [`HandPipeline::tick`], finds palms with an
//! SSD-style palm detection network, derives a rotated crop around the most confident palm, runs a
//! hand landmark network on that crop and smooths the landmarks over time. Detections, the crop
//! region and the smoothed landmarks are kept in GPU buffers together with indirect draw
//! arguments, so a renderer can draw them without reading anything back.
//!
//! Inference itself is pluggable through [`PalmModel`] and [`LandmarkModel`]; [`nn`] implements
//! both for ONNX models using `tract`. Both networks run on worker threads, and a tick publishes
//! the results of the frame submitted by the tick before it.
//!
//! # Coordinates
//!
//! Unless noted otherwise, 2D positions are in *normalized input space*: the frame is letterboxed
//! into a centered square with a side length of `max(width, height)`, and that square spans
//! `[0, 1]²`, with X pointing right and Y pointing down. See [`resolution::Letterbox`].
//!
//! Landmark Z coordinates come straight from the landmark network and use the same scale as X and
//! Y, with smaller values being closer to the camera.

use log::LevelFilter;

pub mod config;
pub mod detection;
pub mod error;
pub mod filter;
pub mod gpu;
pub mod image;
pub mod iter;
pub mod landmark;
pub mod nn;
pub mod num;
pub mod palm;
pub mod pipeline;
pub mod rect;
pub mod resolution;
pub mod roi;
pub mod timer;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use landmark::LandmarkModel;
pub use palm::PalmModel;
pub use pipeline::{HandPipeline, PipelineOutputs};

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .filter(Some("wgpu"), LevelFilter::Warn)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and this library log at *debug* level, `wgpu` at *warn* level. `RUST_LOG`
/// overrides these.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
