//! Geometry solver seam.

use calib_capture_core::{CorrespondenceSample, ImageSize};
use nalgebra::Matrix3;

/// Raw result of a successful solve.
#[derive(Clone, Debug, PartialEq)]
pub struct SolverSolution {
    pub camera_matrix: Matrix3<f64>,
    pub distortion_coeffs: Vec<f64>,
    pub rms: f64,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("too few samples for a solve (have {have}, need {need})")]
    TooFewSamples { have: usize, need: usize },
    #[error("degenerate input: {0}")]
    Degenerate(String),
    #[error("solver failed: {0}")]
    Internal(String),
}

/// External nonlinear camera calibration.
///
/// Called from a background thread; may take seconds and may fail or panic.
pub trait GeometrySolver: Send + Sync {
    fn solve(
        &self,
        samples: &[CorrespondenceSample],
        image_size: ImageSize,
    ) -> Result<SolverSolution, SolverError>;
}

impl<F> GeometrySolver for F
where
    F: Fn(&[CorrespondenceSample], ImageSize) -> Result<SolverSolution, SolverError> + Send + Sync,
{
    fn solve(
        &self,
        samples: &[CorrespondenceSample],
        image_size: ImageSize,
    ) -> Result<SolverSolution, SolverError> {
        self(samples, image_size)
    }
}
