//! Camera intrinsic model produced by a successful solve.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(thiserror::Error, Debug)]
pub enum IntrinsicsIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Camera matrix, distortion coefficients and the residual of the solve
/// that produced them.
///
/// Distortion follows the usual `[k1, k2, p1, p2, k3, ...]` ordering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicModel {
    pub camera_matrix: Matrix3<f64>,
    pub distortion_coeffs: Vec<f64>,
    /// `None` until a solve has succeeded.
    #[serde(default)]
    pub rms: Option<f64>,
}

impl Default for IntrinsicModel {
    fn default() -> Self {
        Self {
            camera_matrix: Matrix3::identity(),
            distortion_coeffs: vec![0.0; 5],
            rms: None,
        }
    }
}

impl IntrinsicModel {
    /// Restore the identity matrix and five zero coefficients.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Flattened named view of the model.
    pub fn parameters(&self) -> IntrinsicParameters {
        let k = &self.camera_matrix;
        let d = |i: usize| self.distortion_coeffs.get(i).copied().unwrap_or(0.0);
        IntrinsicParameters {
            focal_length_x: k[(0, 0)],
            focal_length_y: k[(1, 1)],
            principal_point_x: k[(0, 2)],
            principal_point_y: k[(1, 2)],
            dist_coeff_k1: d(0),
            dist_coeff_k2: d(1),
            dist_coeff_p1: d(2),
            dist_coeff_p2: d(3),
            dist_coeff_k3: d(4),
        }
    }

    /// Build a pinhole model back from its named parameters (zero skew).
    pub fn from_parameters(p: &IntrinsicParameters) -> Self {
        Self {
            camera_matrix: Matrix3::new(
                p.focal_length_x, 0.0, p.principal_point_x, //
                0.0, p.focal_length_y, p.principal_point_y, //
                0.0, 0.0, 1.0,
            ),
            distortion_coeffs: vec![
                p.dist_coeff_k1,
                p.dist_coeff_k2,
                p.dist_coeff_p1,
                p.dist_coeff_p2,
                p.dist_coeff_k3,
            ],
            rms: None,
        }
    }

    /// True when every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.camera_matrix.iter().all(|v| v.is_finite())
            && self.distortion_coeffs.iter().all(|v| v.is_finite())
            && self.rms.is_none_or(f64::is_finite)
    }

    /// Load a model from JSON on disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, IntrinsicsIoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this model to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), IntrinsicsIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Named intrinsic values as exposed to configuration layers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicParameters {
    pub focal_length_x: f64,
    pub focal_length_y: f64,
    pub principal_point_x: f64,
    pub principal_point_y: f64,
    pub dist_coeff_k1: f64,
    pub dist_coeff_k2: f64,
    pub dist_coeff_p1: f64,
    pub dist_coeff_p2: f64,
    pub dist_coeff_k3: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> IntrinsicModel {
        IntrinsicModel {
            camera_matrix: Matrix3::new(
                800.0, 0.0, 320.0, //
                0.0, 810.0, 240.0, //
                0.0, 0.0, 1.0,
            ),
            distortion_coeffs: vec![-0.1, 0.01, 0.001, -0.002, 0.0005],
            rms: Some(0.31),
        }
    }

    #[test]
    fn parameters_read_matrix_entries() {
        let p = sample_model().parameters();
        assert_eq!(p.focal_length_x, 800.0);
        assert_eq!(p.focal_length_y, 810.0);
        assert_eq!(p.principal_point_x, 320.0);
        assert_eq!(p.principal_point_y, 240.0);
        assert_eq!(p.dist_coeff_p2, -0.002);
    }

    #[test]
    fn short_distortion_vector_reads_as_zero() {
        let model = IntrinsicModel {
            distortion_coeffs: vec![0.2],
            ..IntrinsicModel::default()
        };
        let p = model.parameters();
        assert_eq!(p.dist_coeff_k1, 0.2);
        assert_eq!(p.dist_coeff_k3, 0.0);
    }

    #[test]
    fn reset_restores_identity() {
        let mut model = sample_model();
        model.reset();
        assert_eq!(model, IntrinsicModel::default());
        assert_eq!(model.distortion_coeffs.len(), 5);
    }

    #[test]
    fn json_file_keeps_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("intrinsics.json");
        let model = sample_model();
        model.write_json(&path).expect("write");
        let back = IntrinsicModel::load_json(&path).expect("load");
        assert_eq!(back, model);
    }

    #[test]
    fn from_parameters_matches_view() {
        let model = sample_model();
        let rebuilt = IntrinsicModel::from_parameters(&model.parameters());
        assert_eq!(rebuilt.camera_matrix, model.camera_matrix);
        assert_eq!(rebuilt.distortion_coeffs, model.distortion_coeffs);
    }
}
