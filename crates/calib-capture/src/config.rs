//! Configuration for the capture pipeline.
//!
//! One plain struct, constructed once (usually from JSON) and handed to the
//! controller, which passes the relevant parts on to each stage.

use calib_capture_core::PatternSpec;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::persist::FrameNaming;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("min_interval_seconds must be finite and >= 0 (got {0})")]
    InvalidMinInterval(f64),
    #[error("dedup_threshold must be finite and > 0 (got {0})")]
    InvalidDedupThreshold(f64),
    #[error("min_samples_for_calibrate must be >= 1")]
    InvalidMinSamples,
    #[error("pattern must have width and height >= 2 (got {width}x{height})")]
    InvalidPatternSize { width: u32, height: u32 },
    #[error("pattern square_size must be finite and > 0 (got {0})")]
    InvalidSquareSize(f64),
    #[error("reduced_image_width must be finite and > 0 (got {0})")]
    InvalidReducedWidth(f64),
    #[error("sub-pixel {field} is out of range")]
    InvalidSubPixel { field: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Corner sub-pixel refinement settings forwarded to the pattern detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubPixelParams {
    pub enabled: bool,
    /// Half-size of the search window in pixels.
    pub window_size: u32,
    pub max_iterations: u32,
    pub epsilon: f64,
}

impl Default for SubPixelParams {
    fn default() -> Self {
        Self {
            enabled: false,
            window_size: 5,
            max_iterations: 30,
            epsilon: 0.1,
        }
    }
}

/// How the controller runs the pattern detector on its own.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Detect on every frame, even while not capturing.
    #[serde(default)]
    pub enabled: bool,
    /// Frames wider than this are downscaled before detection.
    #[serde(default = "default_reduced_image_width")]
    pub reduced_image_width: f64,
    #[serde(default)]
    pub sub_pixel: SubPixelParams,
}

fn default_reduced_image_width() -> f64 {
    900.0
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            enabled: false,
            reduced_image_width: default_reduced_image_width(),
            sub_pixel: SubPixelParams::default(),
        }
    }
}

/// Admission policy shared by the live path and bulk reload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateParams {
    pub min_interval_seconds: f64,
    pub frame_skip: u32,
}

fn default_dedup_threshold() -> f64 {
    50.0
}

fn default_min_samples() -> usize {
    30
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("test-data/intrinsic_calibration")
}

/// Every recognised option of the capture pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub pattern: PatternSpec,
    /// Minimum time between two admitted detections, in seconds.
    #[serde(default)]
    pub min_interval_seconds: f64,
    /// Admit only every `frame_skip + 1`-th frame.
    #[serde(default)]
    pub frame_skip: u32,
    /// Mean squared corner distance (px²) below which a sample is redundant.
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples_for_calibrate: usize,
    /// Where captured frames are written and bulk-loaded from.
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default)]
    pub frame_naming: FrameNaming,
    #[serde(default)]
    pub detection: DetectionParams,
    /// If set, the model is written here as JSON after each successful solve.
    #[serde(default)]
    pub intrinsics_path: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pattern: PatternSpec::default(),
            min_interval_seconds: 0.0,
            frame_skip: 0,
            dedup_threshold: default_dedup_threshold(),
            min_samples_for_calibrate: default_min_samples(),
            image_dir: default_image_dir(),
            frame_naming: FrameNaming::default(),
            detection: DetectionParams::default(),
            intrinsics_path: None,
        }
    }
}

impl CaptureConfig {
    /// Check every option; the first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.min_interval_seconds.is_finite() || self.min_interval_seconds < 0.0 {
            return Err(ConfigError::InvalidMinInterval(self.min_interval_seconds));
        }
        if !self.dedup_threshold.is_finite() || self.dedup_threshold <= 0.0 {
            return Err(ConfigError::InvalidDedupThreshold(self.dedup_threshold));
        }
        if self.min_samples_for_calibrate == 0 {
            return Err(ConfigError::InvalidMinSamples);
        }
        let size = self.pattern.size;
        if size.width < 2 || size.height < 2 {
            return Err(ConfigError::InvalidPatternSize {
                width: size.width,
                height: size.height,
            });
        }
        if !self.pattern.square_size.is_finite() || self.pattern.square_size <= 0.0 {
            return Err(ConfigError::InvalidSquareSize(self.pattern.square_size));
        }
        let det = &self.detection;
        if !det.reduced_image_width.is_finite() || det.reduced_image_width <= 0.0 {
            return Err(ConfigError::InvalidReducedWidth(det.reduced_image_width));
        }
        if det.sub_pixel.window_size == 0 {
            return Err(ConfigError::InvalidSubPixel {
                field: "window_size",
            });
        }
        if det.sub_pixel.max_iterations == 0 {
            return Err(ConfigError::InvalidSubPixel {
                field: "max_iterations",
            });
        }
        if !det.sub_pixel.epsilon.is_finite() || det.sub_pixel.epsilon <= 0.0 {
            return Err(ConfigError::InvalidSubPixel { field: "epsilon" });
        }
        Ok(())
    }

    pub fn gate_params(&self) -> GateParams {
        GateParams {
            min_interval_seconds: self.min_interval_seconds,
            frame_skip: self.frame_skip,
        }
    }

    /// Load a JSON config from disk and validate it.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
