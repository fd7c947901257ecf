//! Camera intrinsic calibration capture for real-time vision pipelines.
//!
//! This crate provides:
//! - a capture state machine ([`CalibrationController`]) fed one greyscale
//!   frame at a time by the host pipeline
//! - time/frame gating and near-duplicate filtering of detected patterns
//! - an asynchronous frame persistence queue and bulk reload of stored frames
//! - single-flight calibration on a background thread, with the resulting
//!   [`IntrinsicModel`](core::IntrinsicModel) published atomically
//!
//! Corner detection and the nonlinear solve are supplied by the host through
//! the [`PatternDetector`] and [`GeometrySolver`] traits.
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use calib_capture::core::{
//!     CorrespondenceSample, GrayFrame, GrayFrameView, ImageSize, PatternSpec,
//! };
//! use calib_capture::{
//!     CalibrationController, CaptureConfig, FrameInput, PatternDetector, SolverError,
//!     SolverSolution, VisionStage,
//! };
//! use nalgebra::Point2;
//!
//! struct MyDetector;
//!
//! impl PatternDetector for MyDetector {
//!     fn find_pattern(
//!         &self,
//!         _: &GrayFrameView<'_>,
//!         _: &PatternSpec,
//!     ) -> Option<Vec<Point2<f32>>> {
//!         None
//!     }
//! }
//!
//! fn my_solver(_: &[CorrespondenceSample], _: ImageSize) -> Result<SolverSolution, SolverError> {
//!     Err(SolverError::Internal("not wired".into()))
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let controller = CalibrationController::new(
//!     CaptureConfig::default(),
//!     Arc::new(MyDetector),
//!     Arc::new(my_solver),
//! )?;
//! controller.start_capture()?;
//!
//! let frame = GrayFrame::filled(640, 480, 0);
//! controller.process_frame(FrameInput::new(0.0, 0, frame.view()))?;
//!
//! controller.stop_capture()?;
//! if let Ok(job) = controller.request_calibrate() {
//!     println!("{:?}", job.wait()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `calib_capture::core`: frames, pattern geometry, samples, intrinsic model.
//! - `calib_capture::config`: [`CaptureConfig`] and its JSON helpers.
//! - `calib_capture::gate`, `calib_capture::dedup`, `calib_capture::store`:
//!   sample admission and storage.
//! - `calib_capture::persist`: frame writing and reload.
//! - `calib_capture::worker`: the calibration worker.
//! - `calib_capture::controller`: the state machine tying it together.

pub use calib_capture_core as core;

pub mod config;
pub mod controller;
pub mod dedup;
pub mod detect;
pub mod error;
pub mod events;
pub mod gate;
pub mod persist;
pub mod solver;
pub mod store;
pub mod worker;

pub use config::{CaptureConfig, ConfigError, DetectionParams, GateParams, SubPixelParams};
pub use controller::{
    CalibrationController, CaptureState, CaptureStatus, FrameInput, FrameOutcome, JobHandle,
    LoadSummary, VisionStage,
};
pub use dedup::{is_duplicate, mean_squared_distance};
pub use detect::{detect_pattern, Detection, PatternDetector};
pub use error::CaptureError;
pub use events::CaptureEvent;
pub use gate::FrameGate;
pub use persist::{
    FrameNaming, FrameStorage, ImagePersistenceQueue, LoadedFrame, PersistError, PngFrameStorage,
};
pub use solver::{GeometrySolver, SolverError, SolverSolution};
pub use store::{InsertOutcome, SampleSnapshot, SampleStore, StoreError};
pub use worker::{CalibrationFailure, CalibrationOutcome, CalibrationWorker, FAILED_RMS};
