//! Calibration pattern geometry.

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Kind of calibration target the detector is asked to find.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    /// Plain chessboard; features are inner corners.
    #[default]
    Checkerboard,
    /// Symmetric grid of circles; features are circle centres.
    Circles,
    /// Asymmetric (staggered) circle grid.
    AsymmetricCircles,
}

/// Grid dimensions in features (inner corners or circles), not squares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternSize {
    pub width: u32,
    pub height: u32,
}

impl PatternSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of features a full detection of this pattern yields.
    #[inline]
    pub fn corner_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for PatternSize {
    fn default() -> Self {
        Self::new(9, 6)
    }
}

/// Full description of the physical target.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternSpec {
    #[serde(default)]
    pub kind: PatternKind,
    #[serde(default)]
    pub size: PatternSize,
    /// Spacing between neighbouring features in board units.
    #[serde(default = "default_square_size")]
    pub square_size: f64,
}

fn default_square_size() -> f64 {
    1.0
}

impl Default for PatternSpec {
    fn default() -> Self {
        Self {
            kind: PatternKind::default(),
            size: PatternSize::default(),
            square_size: default_square_size(),
        }
    }
}

impl PatternSpec {
    /// Board-frame coordinates of every feature, in detector order.
    ///
    /// Row-major (`y` outer, `x` inner) on the `z = 0` plane. The asymmetric
    /// circle grid shifts odd rows by one spacing along `x`.
    pub fn object_points(&self) -> Vec<Point3<f32>> {
        let s = self.square_size as f32;
        let mut points = Vec::with_capacity(self.size.corner_count());
        for y in 0..self.size.height {
            for x in 0..self.size.width {
                let px = match self.kind {
                    PatternKind::AsymmetricCircles => (2 * x + y % 2) as f32 * s,
                    PatternKind::Checkerboard | PatternKind::Circles => x as f32 * s,
                };
                points.push(Point3::new(px, y as f32 * s, 0.0));
            }
        }
        points
    }
}
