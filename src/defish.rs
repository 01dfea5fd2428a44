//! Fisheye distortion correction through a precomputed coordinate remap.
//!
//! Each hemisphere is modelled as a pinhole camera with focal length equal to
//! half the hemisphere width on both axes and the principal point at its
//! centre. For every pixel of the undistorted output the table stores the
//! position in the distorted source, computed with the two-term radial model
//! `r' = r * (1 + k1 r^2 + k2 r^4)`. Tangential terms are fixed at zero.
//!
//! Tables are a pure function of [`RemapKey`], so a corrector keeps the ones it
//! has built and reuses them across frames and across both hemispheres.

use image::RgbImage;
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::calibration::CalibrationProfile;

const CHANNELS: usize = 3;
// Both hemispheres may need their own table when an odd source split makes them differ.
const MAX_CACHED_TABLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn for_hemisphere(width: u32, height: u32) -> Self {
        let half_w = f64::from(width) / 2.0;
        Self {
            fx: half_w,
            fy: half_w,
            cx: half_w,
            cy: f64::from(height) / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadialDistortion {
    pub k1: f64,
    pub k2: f64,
}

impl RadialDistortion {
    pub fn from_profile(profile: &CalibrationProfile) -> Self {
        let (k1, k2) = profile.coefficients();
        Self { k1, k2 }
    }

    /// Maps a normalized undistorted point to its distorted position.
    #[inline]
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + self.k1 * r2 + self.k2 * r2 * r2;
        (x * radial, y * radial)
    }
}

/// Everything a remap table depends on. Coefficients are keyed by bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemapKey {
    pub src_width: u32,
    pub src_height: u32,
    pub out_width: u32,
    pub out_height: u32,
    k1_bits: u64,
    k2_bits: u64,
}

impl RemapKey {
    pub fn new(src: (u32, u32), out: (u32, u32), distortion: RadialDistortion) -> Self {
        Self {
            src_width: src.0,
            src_height: src.1,
            out_width: out.0,
            out_height: out.1,
            k1_bits: distortion.k1.to_bits(),
            k2_bits: distortion.k2.to_bits(),
        }
    }

    pub fn distortion(&self) -> RadialDistortion {
        RadialDistortion {
            k1: f64::from_bits(self.k1_bits),
            k2: f64::from_bits(self.k2_bits),
        }
    }
}

/// Per-output-pixel source coordinates, row-major, `out_width * out_height` long.
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    key: RemapKey,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RemapTable {
    pub fn build(key: RemapKey) -> Self {
        let k = Intrinsics::for_hemisphere(key.src_width, key.src_height);
        let distortion = key.distortion();
        let out_w = key.out_width as usize;
        let out_h = key.out_height as usize;

        let mut map_x = Vec::with_capacity(out_w * out_h);
        let mut map_y = Vec::with_capacity(out_w * out_h);
        for v in 0..out_h {
            let y = (v as f64 - k.cy) / k.fy;
            for u in 0..out_w {
                let x = (u as f64 - k.cx) / k.fx;
                let (xd, yd) = distortion.distort(x, y);
                map_x.push((k.fx * xd + k.cx) as f32);
                map_y.push((k.fy * yd + k.cy) as f32);
            }
        }

        Self { key, map_x, map_y }
    }

    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    /// Resamples `src` through the table with bilinear interpolation.
    /// Samples falling outside the source read as black.
    pub fn remap(&self, src: &RgbImage) -> RgbImage {
        let out_w = self.key.out_width as usize;
        let out_h = self.key.out_height as usize;
        if out_w == 0 || out_h == 0 {
            return RgbImage::new(self.key.out_width, self.key.out_height);
        }

        let (src_w, src_h) = (src.width() as usize, src.height() as usize);
        let src_raw = src.as_raw();
        let mut dst = vec![0u8; out_w * out_h * CHANNELS];

        dst.par_chunks_mut(out_w * CHANNELS)
            .enumerate()
            .for_each(|(v, row)| {
                let offset = v * out_w;
                for u in 0..out_w {
                    let px = sample_bilinear(
                        src_raw,
                        src_w,
                        src_h,
                        self.map_x[offset + u],
                        self.map_y[offset + u],
                    );
                    row[u * CHANNELS..(u + 1) * CHANNELS].copy_from_slice(&px);
                }
            });

        // Buffer length is out_w * out_h * 3 by construction.
        RgbImage::from_raw(self.key.out_width, self.key.out_height, dst)
            .unwrap_or_else(|| RgbImage::new(self.key.out_width, self.key.out_height))
    }
}

#[inline]
fn sample_bilinear(src: &[u8], w: usize, h: usize, x: f32, y: f32) -> [u8; CHANNELS] {
    if !x.is_finite() || !y.is_finite() {
        return [0; CHANNELS];
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let taps = [
        (0, 0, (1.0 - fx) * (1.0 - fy)),
        (1, 0, fx * (1.0 - fy)),
        (0, 1, (1.0 - fx) * fy),
        (1, 1, fx * fy),
    ];

    let mut acc = [0f32; CHANNELS];
    for (dx, dy, weight) in taps {
        if weight == 0.0 {
            continue;
        }
        let sx = x0 + dx;
        let sy = y0 + dy;
        if sx < 0 || sy < 0 || sx >= w as i64 || sy >= h as i64 {
            continue;
        }
        let base = (sy as usize * w + sx as usize) * CHANNELS;
        for c in 0..CHANNELS {
            acc[c] += weight * f32::from(src[base + c]);
        }
    }
    acc.map(|v| v.round().clamp(0.0, 255.0) as u8)
}

/// Undistorts hemispheres with one fixed set of coefficients.
pub struct DistortionCorrector {
    distortion: RadialDistortion,
    tables: HashMap<RemapKey, RemapTable>,
}

impl DistortionCorrector {
    pub fn new(profile: &CalibrationProfile) -> Self {
        Self {
            distortion: RadialDistortion::from_profile(profile),
            tables: HashMap::new(),
        }
    }

    pub fn cached_tables(&self) -> usize {
        self.tables.len()
    }

    /// Produces an `out_w x out_h` rectilinear image from one hemisphere.
    pub fn correct(&mut self, hemisphere: &RgbImage, out_w: u32, out_h: u32) -> RgbImage {
        let key = RemapKey::new(hemisphere.dimensions(), (out_w, out_h), self.distortion);
        self.table(key).remap(hemisphere)
    }

    fn table(&mut self, key: RemapKey) -> &RemapTable {
        if !self.tables.contains_key(&key) && self.tables.len() >= MAX_CACHED_TABLES {
            self.tables.clear();
        }
        self.tables.entry(key).or_insert_with(|| {
            debug!(
                src = %format!("{}x{}", key.src_width, key.src_height),
                out = %format!("{}x{}", key.out_width, key.out_height),
                "building remap table"
            );
            RemapTable::build(key)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_ops::{assemble, gradient_frame, split, Rotation};

    fn identity_profile() -> CalibrationProfile {
        CalibrationProfile::with_coefficients(0.0, 0.0).expect("finite")
    }

    #[test]
    fn zero_coefficients_give_identity_map() {
        let key = RemapKey::new((6, 4), (6, 4), RadialDistortion { k1: 0.0, k2: 0.0 });
        let table = RemapTable::build(key);
        for v in 0..4usize {
            for u in 0..6usize {
                assert_eq!(table.map_x()[v * 6 + u], u as f32);
                assert_eq!(table.map_y()[v * 6 + u], v as f32);
            }
        }
    }

    #[test]
    fn identity_correction_reproduces_hemisphere() {
        let mut corrector = DistortionCorrector::new(&identity_profile());
        let hemi = gradient_frame(12, 10);
        assert_eq!(corrector.correct(&hemi, 12, 10), hemi);
    }

    #[test]
    fn split_correct_assemble_is_lossless_without_distortion() {
        let frame = gradient_frame(24, 8);
        let mut corrector = DistortionCorrector::new(&identity_profile());
        let (left, right) = split(&frame);
        let a = corrector.correct(&left, 12, 8);
        let b = corrector.correct(&right, 12, 8);
        let pano = assemble(&a, &b, Rotation::None).expect("same height");
        assert_eq!(pano, frame);
        assert_eq!(corrector.cached_tables(), 1);
    }

    #[test]
    fn correction_is_deterministic_and_sized() {
        let profile = CalibrationProfile::default();
        let hemi = gradient_frame(40, 40);

        let mut first = DistortionCorrector::new(&profile);
        let mut second = DistortionCorrector::new(&profile);
        let a = first.correct(&hemi, 32, 24);
        let b = first.correct(&hemi, 32, 24);
        let c = second.correct(&hemi, 32, 24);
        assert_eq!(a.dimensions(), (32, 24));
        assert_eq!(a.as_raw(), b.as_raw());
        assert_eq!(a.as_raw(), c.as_raw());
    }

    #[test]
    fn tables_are_pure_functions_of_their_key() {
        let key = RemapKey::new((64, 64), (48, 30), RadialDistortion { k1: -0.28, k2: 0.05 });
        assert_eq!(RemapTable::build(key), RemapTable::build(key));
    }

    #[test]
    fn barrel_coefficients_pull_corners_inward() {
        let key = RemapKey::new((100, 100), (100, 100), RadialDistortion { k1: -0.28, k2: 0.05 });
        let table = RemapTable::build(key);
        // centre stays put, corner samples from closer to the centre
        assert_eq!(table.map_x()[50 * 100 + 50], 50.0);
        assert!(table.map_x()[0] > 0.0);
        assert!(table.map_y()[0] > 0.0);
    }

    #[test]
    fn cache_is_keyed_and_bounded() {
        let mut corrector = DistortionCorrector::new(&CalibrationProfile::default());
        let hemi = gradient_frame(16, 16);
        corrector.correct(&hemi, 8, 8);
        corrector.correct(&hemi, 8, 8);
        assert_eq!(corrector.cached_tables(), 1);
        corrector.correct(&gradient_frame(17, 16), 8, 8);
        assert_eq!(corrector.cached_tables(), 2);
        for size in 1..=4 {
            corrector.correct(&hemi, size, size);
        }
        assert!(corrector.cached_tables() <= MAX_CACHED_TABLES);
    }

    #[test]
    fn empty_inputs_produce_black_or_empty_output() {
        let mut corrector = DistortionCorrector::new(&CalibrationProfile::default());
        let out = corrector.correct(&RgbImage::new(0, 4), 3, 2);
        assert_eq!(out.dimensions(), (3, 2));
        assert!(out.as_raw().iter().all(|&b| b == 0));
        assert_eq!(corrector.correct(&gradient_frame(4, 4), 0, 5).dimensions(), (0, 5));
    }
}
