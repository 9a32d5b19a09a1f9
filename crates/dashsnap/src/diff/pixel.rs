//! Pixel-level comparison: full diff with anti-aliasing tolerance and
//! seeded early-exit sampling.

use image::RgbaImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::hash::ImageHash;

/// Outcome of a full per-pixel comparison.
#[derive(Debug, Clone)]
pub(crate) struct PixelComparison {
    pub total_pixels: u64,
    pub diff_pixels: u64,
    pub diff_pct: f64,
    /// Row-major mask of differing pixels, used for artifact rendering.
    pub diff_mask: Vec<bool>,
}

/// Maximum per-channel delta, normalized to [0, 1].
#[inline]
fn channel_delta(a: &[u8; 4], b: &[u8; 4]) -> f64 {
    let mut max = 0u8;
    for i in 0..4 {
        let d = a[i].abs_diff(b[i]);
        if d > max {
            max = d;
        }
    }
    f64::from(max) / 255.0
}

#[inline]
fn pixels_match(a: &[u8; 4], b: &[u8; 4], threshold: f64) -> bool {
    channel_delta(a, b) <= threshold
}

/// One direction of the anti-aliasing test: whether `own`'s color at
/// (x, y) appears within one pixel of the same position in `other`.
fn is_antialiasing_shift(
    x: u32,
    y: u32,
    own: &RgbaImage,
    other: &RgbaImage,
    threshold: f64,
) -> bool {
    let (width, height) = own.dimensions();
    let own_px = own.get_pixel(x, y).0;

    for dy in -1i64..=1 {
        for dx in -1i64..=1 {
            if dx == 0 && dy == 0 {
                continue;
            }
            let nx = x as i64 + dx;
            let ny = y as i64 + dy;
            if nx < 0 || ny < 0 || nx >= i64::from(width) || ny >= i64::from(height) {
                continue;
            }
            let neighbor = other.get_pixel(nx as u32, ny as u32).0;
            if pixels_match(&own_px, &neighbor, threshold) {
                return true;
            }
        }
    }
    false
}

/// Full pixel-wise comparison.
///
/// Both images must share dimensions; callers enforce that before entry.
pub(crate) fn compare_pixels(
    baseline: &RgbaImage,
    current: &RgbaImage,
    threshold: f64,
    ignore_antialiasing: bool,
) -> PixelComparison {
    let (width, height) = baseline.dimensions();
    let total_pixels = u64::from(width) * u64::from(height);
    let mut diff_mask = vec![false; (width as usize) * (height as usize)];
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let a = baseline.get_pixel(x, y).0;
            let b = current.get_pixel(x, y).0;
            if pixels_match(&a, &b, threshold) {
                continue;
            }
            // An edge shifted by a pixel leaves both colors present in the
            // other image's neighborhood; a genuine content change does not
            if ignore_antialiasing
                && is_antialiasing_shift(x, y, baseline, current, threshold)
                && is_antialiasing_shift(x, y, current, baseline, threshold)
            {
                continue;
            }
            diff_mask[(y as usize) * (width as usize) + (x as usize)] = true;
            diff_pixels += 1;
        }
    }

    let diff_pct = if total_pixels == 0 {
        0.0
    } else {
        diff_pixels as f64 / total_pixels as f64
    };

    PixelComparison {
        total_pixels,
        diff_pixels,
        diff_pct,
        diff_mask,
    }
}

/// Derive a reproducible sampling seed from the two content hashes.
pub(crate) fn sampling_seed(baseline: &ImageHash, current: &ImageHash) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(baseline.as_bytes());
    hasher.update(current.as_bytes());
    hasher.finalize().into()
}

/// Uniformly sample `fraction` of pixel positions and return the ratio of
/// sampled positions that differ. Deterministic for a given seed.
pub(crate) fn sample_diff_ratio(
    baseline: &RgbaImage,
    current: &RgbaImage,
    threshold: f64,
    fraction: f64,
    seed: [u8; 32],
) -> f64 {
    let (width, height) = baseline.dimensions();
    let total = u64::from(width) * u64::from(height);
    if total == 0 {
        return 0.0;
    }

    let samples = ((total as f64 * fraction).ceil() as u64).max(1);
    let mut rng = StdRng::from_seed(seed);
    let mut differing = 0u64;

    for _ in 0..samples {
        let x = rng.gen_range(0..width);
        let y = rng.gen_range(0..height);
        let a = baseline.get_pixel(x, y).0;
        let b = current.get_pixel(x, y).0;
        if !pixels_match(&a, &b, threshold) {
            differing += 1;
        }
    }

    differing as f64 / samples as f64
}
