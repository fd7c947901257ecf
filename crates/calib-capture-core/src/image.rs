//! Lightweight 8-bit greyscale frames.
//!
//! Frames are stored row-major, one byte per pixel. The pipeline never needs
//! colour, so this is the only pixel format carried between stages.

use serde::{Deserialize, Serialize};

/// Width and height of a frame in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: usize,
    pub height: usize,
}

impl ImageSize {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GrayFrameView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // row-major, len = w*h
}

impl GrayFrameView<'_> {
    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    /// Copy the view into an owned frame.
    pub fn to_owned_frame(&self) -> GrayFrame {
        GrayFrame {
            width: self.width,
            height: self.height,
            data: self.data.to_vec(),
        }
    }
}

/// Owned greyscale frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrayFrame {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayFrame {
    /// Wrap a raw buffer; returns `None` when `data.len() != width * height`.
    pub fn from_raw(width: usize, height: usize, data: Vec<u8>) -> Option<Self> {
        let expected = width.checked_mul(height)?;
        (data.len() == expected).then_some(Self {
            width,
            height,
            data,
        })
    }

    /// Frame filled with a single grey value.
    pub fn filled(width: usize, height: usize, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    #[inline]
    pub fn view(&self) -> GrayFrameView<'_> {
        GrayFrameView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[inline]
    pub fn size(&self) -> ImageSize {
        ImageSize::new(self.width, self.height)
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y * self.width + x).copied()
    }
}

#[inline]
fn get_gray(src: &GrayFrameView<'_>, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i32 || y >= src.height as i32 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

#[inline]
pub fn sample_bilinear(src: &GrayFrameView<'_>, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_gray(src, x0, y0) as f32;
    let p10 = get_gray(src, x0 + 1, y0) as f32;
    let p01 = get_gray(src, x0, y0 + 1) as f32;
    let p11 = get_gray(src, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

#[inline]
pub fn sample_bilinear_u8(src: &GrayFrameView<'_>, x: f32, y: f32) -> u8 {
    sample_bilinear(src, x, y).clamp(0.0, 255.0) as u8
}

/// Uniformly rescale a frame by `scale` (0 < scale <= 1 shrinks).
///
/// Output dimensions are rounded and clamped to at least one pixel. Samples
/// are taken at the source position of each output pixel centre.
pub fn resize_gray(src: &GrayFrameView<'_>, scale: f64) -> GrayFrame {
    let out_w = ((src.width as f64 * scale).round() as usize).max(1);
    let out_h = ((src.height as f64 * scale).round() as usize).max(1);
    let sx = src.width as f32 / out_w as f32;
    let sy = src.height as f32 / out_h as f32;

    let mut out = vec![0u8; out_w * out_h];
    for y in 0..out_h {
        let v = (y as f32 + 0.5) * sy - 0.5;
        for x in 0..out_w {
            let u = (x as f32 + 0.5) * sx - 0.5;
            out[y * out_w + x] = sample_bilinear_u8(src, u.max(0.0), v.max(0.0));
        }
    }

    GrayFrame {
        width: out_w,
        height: out_h,
        data: out,
    }
}

/// Scale factor that brings `width` down to at most `max_width` (never upscales).
#[inline]
pub fn downscale_factor(width: usize, max_width: f64) -> f64 {
    if width == 0 || !max_width.is_finite() || max_width <= 0.0 {
        return 1.0;
    }
    (max_width / width as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_rejects_wrong_length() {
        assert!(GrayFrame::from_raw(4, 3, vec![0; 11]).is_none());
        assert!(GrayFrame::from_raw(4, 3, vec![0; 12]).is_some());
    }

    #[test]
    fn bilinear_interpolates_between_pixels() {
        let frame = GrayFrame::from_raw(2, 1, vec![0, 100]).expect("2x1 frame");
        let v = sample_bilinear(&frame.view(), 0.5, 0.0);
        assert!((v - 50.0).abs() < 1e-4, "got {v}");
    }

    #[test]
    fn resize_halves_dimensions_and_keeps_flat_value() {
        let frame = GrayFrame::filled(40, 20, 77);
        let small = resize_gray(&frame.view(), 0.5);
        assert_eq!(small.size(), ImageSize::new(20, 10));
        // interior pixels of a flat image stay flat
        assert_eq!(small.get(5, 5), Some(77));
    }

    #[test]
    fn downscale_factor_never_upscales() {
        assert_eq!(downscale_factor(600, 900.0), 1.0);
        assert!((downscale_factor(1800, 900.0) - 0.5).abs() < 1e-12);
        assert_eq!(downscale_factor(1800, 0.0), 1.0);
    }
}
