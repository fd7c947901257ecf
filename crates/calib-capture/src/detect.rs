//! Pattern detection seam.
//!
//! Corner finding itself is provided by the host through [`PatternDetector`].
//! This module adds the policy around it: detect on a downscaled copy of
//! large frames, map corners back to full resolution and optionally run the
//! detector's sub-pixel refinement on the full frame.

use calib_capture_core::{
    downscale_factor, resize_gray, GrayFrameView, PatternSize, PatternSpec,
};
use log::debug;
use nalgebra::Point2;

use crate::config::{DetectionParams, SubPixelParams};

/// Output of one detector run on one frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub found: bool,
    /// Corners in detector order, full-resolution pixel coordinates.
    pub image_points: Vec<Point2<f32>>,
    pub pattern_size: PatternSize,
}

impl Detection {
    pub fn found(image_points: Vec<Point2<f32>>, pattern_size: PatternSize) -> Self {
        Self {
            found: true,
            image_points,
            pattern_size,
        }
    }

    pub fn not_found(pattern_size: PatternSize) -> Self {
        Self {
            found: false,
            image_points: Vec::new(),
            pattern_size,
        }
    }
}

/// External corner detector.
pub trait PatternDetector: Send + Sync {
    /// Locate `pattern` in `frame` and return its features in row-major
    /// detector order, or `None` when the pattern is not (fully) visible.
    fn find_pattern(
        &self,
        frame: &GrayFrameView<'_>,
        pattern: &PatternSpec,
    ) -> Option<Vec<Point2<f32>>>;

    /// Refine corner positions in place. The default leaves them untouched.
    fn refine_corners(
        &self,
        _frame: &GrayFrameView<'_>,
        _corners: &mut [Point2<f32>],
        _params: &SubPixelParams,
    ) {
    }
}

/// Run `detector` on `frame`, downscaling to at most `max_width` pixels wide.
///
/// Pass `None` to detect at full resolution. A detection whose corner count
/// does not match the pattern is reported as not found.
pub fn detect_pattern(
    detector: &dyn PatternDetector,
    frame: &GrayFrameView<'_>,
    pattern: &PatternSpec,
    params: &DetectionParams,
    max_width: Option<f64>,
) -> Detection {
    let scale = max_width.map_or(1.0, |w| downscale_factor(frame.width, w));

    let found = if scale < 1.0 {
        let small = resize_gray(frame, scale);
        let sx = frame.width as f32 / small.width as f32;
        let sy = frame.height as f32 / small.height as f32;
        detector
            .find_pattern(&small.view(), pattern)
            .map(|pts| pts.into_iter().map(|p| Point2::new(p.x * sx, p.y * sy)).collect())
    } else {
        detector.find_pattern(frame, pattern)
    };

    let Some(mut corners) = found else {
        return Detection::not_found(pattern.size);
    };

    if corners.len() != pattern.size.corner_count() {
        debug!(
            "detector returned {} corners, expected {}",
            corners.len(),
            pattern.size.corner_count()
        );
        return Detection::not_found(pattern.size);
    }

    if params.sub_pixel.enabled {
        detector.refine_corners(frame, &mut corners, &params.sub_pixel);
    }

    Detection::found(corners, pattern.size)
}
