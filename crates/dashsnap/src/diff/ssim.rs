//! Structural similarity scoring.
//!
//! Wraps the `image-compare` MSSIM implementation over grayscale
//! conversions and exposes both the scalar score and the per-window
//! similarity map used for heatmap rendering.

use image::imageops;
use image::{GrayImage, RgbaImage};
use image_compare::Algorithm;

use crate::error::{Result, SnapError};

/// SSIM score plus the window-level similarity map.
pub(crate) struct StructuralScore {
    /// Mean structural similarity in [0, 1].
    pub score: f64,
    /// Grayscale map where darker means less similar.
    pub map: GrayImage,
}

/// Compute MSSIM over grayscale conversions at native resolution.
pub(crate) fn structural_similarity(
    baseline: &RgbaImage,
    current: &RgbaImage,
) -> Result<StructuralScore> {
    let gray_a = imageops::grayscale(baseline);
    let gray_b = imageops::grayscale(current);

    let similarity =
        image_compare::gray_similarity_structure(&Algorithm::MSSIMSimple, &gray_a, &gray_b)
            .map_err(|e| SnapError::ImageDecode(format!("ssim computation failed: {e}")))?;

    // The similarity map is an f32 luma buffer in [0, 1]; quantize for
    // artifact rendering.
    // `image_compare::SimilarityImage` is not a publicly nameable type (its
    // owning module is private), so we go through its public
    // `to_color_map` method, which for a grayscale input (as used above)
    // performs the same [0,1] -> u8 quantization we need.
    let map = similarity.image.to_color_map().into_luma8();

    Ok(StructuralScore {
        score: similarity.score.clamp(0.0, 1.0),
        map,
    })
}
