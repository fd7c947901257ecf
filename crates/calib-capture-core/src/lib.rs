//! Core types for calibration sample capture.
//!
//! This crate is intentionally small and free of threads or I/O policy. It
//! does *not* depend on any concrete pattern detector, solver or image codec.

mod image;
mod intrinsics;
mod logger;
mod pattern;
mod sample;

pub use image::{
    downscale_factor, resize_gray, sample_bilinear, sample_bilinear_u8, GrayFrame, GrayFrameView,
    ImageSize,
};
pub use intrinsics::{IntrinsicModel, IntrinsicParameters, IntrinsicsIoError};
pub use pattern::{PatternKind, PatternSize, PatternSpec};
pub use sample::{CorrespondenceSample, SampleError};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, level_for_verbosity};
