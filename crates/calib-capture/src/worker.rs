//! Single-flight calibration over a frozen sample set.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use calib_capture_core::{CorrespondenceSample, ImageSize, IntrinsicModel};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::solver::{GeometrySolver, SolverError};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Residual reported for a failed solve.
pub const FAILED_RMS: f64 = -1.0;

/// Why a calibration pass produced no model.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CalibrationFailure {
    #[error("no samples to calibrate with")]
    NoSamples,
    #[error("image size is unknown")]
    UnknownImageSize,
    #[error("samples mix several pattern sizes")]
    MixedPatternSizes,
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("solver returned non-finite values")]
    NonFinite,
    #[error("solver panicked: {0}")]
    Panicked(String),
}

/// Result of one calibration pass.
#[derive(Clone, Debug, PartialEq)]
pub enum CalibrationOutcome {
    Solved { rms: f64, sample_count: usize },
    Failed(CalibrationFailure),
}

impl CalibrationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CalibrationOutcome::Solved { .. })
    }

    /// Residual of the solve, or [`FAILED_RMS`].
    pub fn reported_rms(&self) -> f64 {
        match self {
            CalibrationOutcome::Solved { rms, .. } => *rms,
            CalibrationOutcome::Failed(_) => FAILED_RMS,
        }
    }
}

/// Runs the external solver and publishes the resulting model.
///
/// `solve_lock` is held for the whole solve, so two calls never overlap.
/// The model is replaced in one assignment after the solve has finished and
/// is left untouched by every failure.
pub struct CalibrationWorker {
    solver: Arc<dyn GeometrySolver>,
    solve_lock: Mutex<()>,
    model: RwLock<Arc<IntrinsicModel>>,
    invocations: AtomicU64,
}

impl CalibrationWorker {
    pub fn new(solver: Arc<dyn GeometrySolver>) -> Self {
        Self::with_model(solver, IntrinsicModel::default())
    }

    pub fn with_model(solver: Arc<dyn GeometrySolver>, model: IntrinsicModel) -> Self {
        Self {
            solver,
            solve_lock: Mutex::new(()),
            model: RwLock::new(Arc::new(model)),
            invocations: AtomicU64::new(0),
        }
    }

    /// Currently published model.
    pub fn model(&self) -> Arc<IntrinsicModel> {
        Arc::clone(&self.model.read())
    }

    /// True while a solve is running.
    pub fn is_busy(&self) -> bool {
        self.solve_lock.is_locked()
    }

    /// How many times the external solver has been called.
    pub fn solver_invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    /// Replace the model with identity intrinsics. Waits for a running solve.
    pub fn reset_model(&self) {
        let _guard = self.solve_lock.lock();
        *self.model.write() = Arc::new(IntrinsicModel::default());
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, samples), fields(samples = samples.len()))
    )]
    pub fn calibrate(
        &self,
        samples: &[CorrespondenceSample],
        image_size: ImageSize,
    ) -> CalibrationOutcome {
        let _guard = self.solve_lock.lock();

        if let Err(failure) = check_input(samples, image_size) {
            warn!("calibration refused: {failure}");
            return CalibrationOutcome::Failed(failure);
        }

        info!(
            "start calibrating with {} samples at {}x{}",
            samples.len(),
            image_size.width,
            image_size.height
        );
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.solver.solve(samples, image_size)
        }));

        let solution = match result {
            Ok(Ok(solution)) => solution,
            Ok(Err(err)) => {
                warn!("calibration failed: {err}");
                return CalibrationOutcome::Failed(err.into());
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!("calibration failed: solver panicked: {msg}");
                return CalibrationOutcome::Failed(CalibrationFailure::Panicked(msg));
            }
        };

        let model = IntrinsicModel {
            camera_matrix: solution.camera_matrix,
            distortion_coeffs: solution.distortion_coeffs,
            rms: Some(solution.rms),
        };
        if !model.is_finite() || solution.rms < 0.0 {
            warn!("calibration failed: solver returned non-finite values");
            return CalibrationOutcome::Failed(CalibrationFailure::NonFinite);
        }

        *self.model.write() = Arc::new(model);
        info!("calibration finished with a RMS of {}", solution.rms);
        CalibrationOutcome::Solved {
            rms: solution.rms,
            sample_count: samples.len(),
        }
    }
}

fn check_input(
    samples: &[CorrespondenceSample],
    image_size: ImageSize,
) -> Result<(), CalibrationFailure> {
    let Some(first) = samples.first() else {
        return Err(CalibrationFailure::NoSamples);
    };
    if image_size.is_empty() {
        return Err(CalibrationFailure::UnknownImageSize);
    }
    if samples
        .iter()
        .any(|s| s.pattern_size() != first.pattern_size())
    {
        return Err(CalibrationFailure::MixedPatternSizes);
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
