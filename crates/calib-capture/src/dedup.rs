//! Near-duplicate rejection.
//!
//! Two samples of the same pattern are compared index by index: the detector
//! reports corners in a fixed order, so corner `i` of one sample corresponds
//! to corner `i` of the other.

use calib_capture_core::CorrespondenceSample;
use nalgebra::Point2;

/// Mean of the squared distances between index-aligned corners.
///
/// Returns `None` when the corner counts differ or both are empty.
pub fn mean_squared_distance(a: &[Point2<f32>], b: &[Point2<f32>]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let sum: f64 = a
        .iter()
        .zip(b)
        .map(|(p, q)| {
            let dx = f64::from(p.x) - f64::from(q.x);
            let dy = f64::from(p.y) - f64::from(q.y);
            dx * dx + dy * dy
        })
        .sum();
    Some(sum / a.len() as f64)
}

/// True if any existing sample lies closer than `threshold` to `candidate`.
///
/// Samples with a different corner count are skipped. The scan stops at the
/// first match.
pub fn is_duplicate(
    candidate: &[Point2<f32>],
    existing: &[CorrespondenceSample],
    threshold: f64,
) -> bool {
    existing.iter().any(|sample| {
        mean_squared_distance(candidate, sample.image_points())
            .is_some_and(|msd| msd < threshold)
    })
}
