use nalgebra::{Point2, Point3};

use crate::pattern::{PatternSize, PatternSpec};

/// Errors raised while building a correspondence sample.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum SampleError {
    #[error("image/object point count mismatch (image={image}, object={object})")]
    PointCountMismatch { image: usize, object: usize },
    #[error("sample has no points")]
    Empty,
}

/// One accepted pairing of detected pattern corners with board coordinates.
///
/// Immutable once built: the accept path creates it, only a store `clear`
/// destroys it.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrespondenceSample {
    image_points: Vec<Point2<f32>>,
    object_points: Vec<Point3<f32>>,
    pattern_size: PatternSize,
    captured_at: f64,
}

impl CorrespondenceSample {
    pub fn new(
        image_points: Vec<Point2<f32>>,
        object_points: Vec<Point3<f32>>,
        pattern_size: PatternSize,
        captured_at: f64,
    ) -> Result<Self, SampleError> {
        if image_points.is_empty() {
            return Err(SampleError::Empty);
        }
        if image_points.len() != object_points.len() {
            return Err(SampleError::PointCountMismatch {
                image: image_points.len(),
                object: object_points.len(),
            });
        }
        Ok(Self {
            image_points,
            object_points,
            pattern_size,
            captured_at,
        })
    }

    /// Pair detected corners with the board grid of `pattern`.
    pub fn from_detection(
        image_points: Vec<Point2<f32>>,
        pattern: &PatternSpec,
        captured_at: f64,
    ) -> Result<Self, SampleError> {
        Self::new(
            image_points,
            pattern.object_points(),
            pattern.size,
            captured_at,
        )
    }

    #[inline]
    pub fn image_points(&self) -> &[Point2<f32>] {
        &self.image_points
    }

    #[inline]
    pub fn object_points(&self) -> &[Point3<f32>] {
        &self.object_points
    }

    #[inline]
    pub fn pattern_size(&self) -> PatternSize {
        self.pattern_size
    }

    /// Host timestamp (monotonic seconds) of the frame the sample came from.
    #[inline]
    pub fn captured_at(&self) -> f64 {
        self.captured_at
    }

    #[inline]
    pub fn corner_count(&self) -> usize {
        self.image_points.len()
    }
}
