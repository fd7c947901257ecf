use crate::config::ConfigError;
use crate::controller::CaptureState;
use crate::persist::PersistError;

/// Errors returned by the capture controller.
///
/// None of these are fatal to the host pipeline: a failed frame is skipped
/// and a refused intent leaves the controller as it was.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("greyscale frame is not available")]
    MissingInput,
    #[error("cannot {op} while {state}")]
    InvalidState {
        op: &'static str,
        state: CaptureState,
    },
    #[error("need at least {need} samples to calibrate, have {have}")]
    NotEnoughSamples { have: usize, need: usize },
    #[error("background worker is not running")]
    WorkerUnavailable,
    #[error("failed to start background thread")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persist(#[from] PersistError),
}
