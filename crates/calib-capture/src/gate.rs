//! Admission filter for detected patterns.

use crate::config::{ConfigError, GateParams};

/// Decides whether a successful detection is offered to the sample store.
///
/// Both policies apply at once: a time debounce (`min_interval_seconds`) and
/// a frame-index stride (`frame_skip`). With their defaults (`0.0` and `0`)
/// each one admits everything, so configuring only one of them yields that
/// policy alone.
#[derive(Clone, Debug)]
pub struct FrameGate {
    params: GateParams,
    last_admitted: Option<f64>,
}

impl FrameGate {
    pub fn new(params: GateParams) -> Result<Self, ConfigError> {
        if !params.min_interval_seconds.is_finite() || params.min_interval_seconds < 0.0 {
            return Err(ConfigError::InvalidMinInterval(params.min_interval_seconds));
        }
        Ok(Self {
            params,
            last_admitted: None,
        })
    }

    pub fn params(&self) -> GateParams {
        self.params
    }

    /// Timestamp of the last admitted detection, if any.
    pub fn last_admitted(&self) -> Option<f64> {
        self.last_admitted
    }

    /// Forget the last admitted timestamp.
    pub fn reset(&mut self) {
        self.last_admitted = None;
    }

    /// `timestamp` is host monotonic seconds. Bookkeeping changes only when
    /// this returns `true`.
    pub fn admit(&mut self, timestamp: f64, pattern_found: bool, frame_index: u64) -> bool {
        if !pattern_found {
            return false;
        }

        let stride = u64::from(self.params.frame_skip) + 1;
        if frame_index % stride != 0 {
            return false;
        }

        if let Some(last) = self.last_admitted {
            if timestamp - last < self.params.min_interval_seconds {
                return false;
            }
        }

        self.last_admitted = Some(timestamp);
        true
    }
}
