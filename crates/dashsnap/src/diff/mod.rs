//! Visual diff engine.
//!
//! Compares a baseline capture against a current capture through a staged
//! pipeline: identity short-circuit on equal hashes, seeded early-exit
//! sampling, full pixel diff with optional anti-aliasing tolerance,
//! structural similarity, weighted region analysis, and severity
//! assignment. Results are cached in a bounded in-process cache.
//!
//! `compare` is deterministic for equal inputs and side-effect free apart
//! from the cache, so it is safe to call from multiple workers.

mod artifacts;
mod cache;
mod pixel;
mod ssim;

pub use cache::{DiffCache, DiffCacheKey, DiffCacheStats, DiffMemoryStats};
pub use cache::{LOW_WATERMARK_BYTES, MAX_ENTRIES, MAX_ENTRY_BYTES, MEMORY_CEILING_BYTES};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::{Result, SnapError};
use crate::hash::ImageHash;
use crate::vision::VisionClassification;

/// Fraction of pixel positions inspected by the early-exit sampler.
const SAMPLE_FRACTION: f64 = 0.10;
/// Sampled difference ratio above which the full diff is skipped.
const EARLY_EXIT_RATIO: f64 = 0.30;

/// Canonical change severity, ordered from benign to breaking.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// No perceptible change.
    #[default]
    None,
    /// Visible but acceptable drift.
    Minor,
    /// Change that needs review.
    Moderate,
    /// Change that breaks the page.
    Breaking,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Minor => write!(f, "minor"),
            Self::Moderate => write!(f, "moderate"),
            Self::Breaking => write!(f, "breaking"),
        }
    }
}

/// Pixel-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Clamp the box to the given image dimensions; `None` when nothing
    /// remains.
    fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(BoundingBox {
            x: self.x,
            y: self.y,
            width: w,
            height: h,
        })
    }
}

/// Resolves a CSS selector to a pixel-space bounding box. The capture layer
/// supplies an implementation backed by the browser driver; tests supply
/// fixed maps.
pub trait RegionResolver: Send + Sync {
    /// Box for the selector, or `None` when the selector matches nothing.
    fn resolve(&self, selector: &str) -> Option<BoundingBox>;
}

/// A named, weighted region of interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    pub selector: String,
    /// Severity bias in [0, 5]; weights at or above 1.5 can escalate the
    /// global verdict to breaking.
    pub weight: f64,
}

/// Options controlling a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffOptions {
    /// Per-pixel color distance below which pixels match, in [0, 1].
    pub pixel_threshold: f64,
    /// Treat one-pixel edge shifts as matching.
    pub ignore_antialiasing: bool,
    /// Ordered regions of interest.
    pub regions: Vec<RegionSpec>,
    /// Whether the caller intends to run semantic analysis on this result.
    pub semantic_analysis: bool,
    /// Worker budget hint for the surrounding runner, in [1, 10].
    pub max_concurrency: usize,
    /// Allowed width/height delta between baseline and current.
    pub dimension_tolerance: u32,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            pixel_threshold: 0.1,
            ignore_antialiasing: true,
            regions: Vec::new(),
            semantic_analysis: false,
            max_concurrency: 4,
            dimension_tolerance: 0,
        }
    }
}

impl DiffOptions {
    /// Validate ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.pixel_threshold) {
            return Err(SnapError::InvalidInput(format!(
                "pixel_threshold must be 0.0-1.0, got {}",
                self.pixel_threshold
            )));
        }
        if !(1..=10).contains(&self.max_concurrency) {
            return Err(SnapError::InvalidInput(format!(
                "max_concurrency must be 1-10, got {}",
                self.max_concurrency
            )));
        }
        for region in &self.regions {
            if !(0.0..=5.0).contains(&region.weight) {
                return Err(SnapError::InvalidInput(format!(
                    "region {} weight must be 0.0-5.0, got {}",
                    region.name, region.weight
                )));
            }
        }
        Ok(())
    }

    /// Stable fingerprint over everything that affects the result, used
    /// for cache keying.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.pixel_threshold.to_le_bytes());
        hasher.update([u8::from(self.ignore_antialiasing)]);
        hasher.update(self.dimension_tolerance.to_le_bytes());
        for region in &self.regions {
            hasher.update(region.name.as_bytes());
            hasher.update([0]);
            hasher.update(region.selector.as_bytes());
            hasher.update([0]);
            hasher.update(region.weight.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(first)
    }
}

/// Pixel and structural metrics for the whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelDiffSummary {
    pub total_pixels: u64,
    pub diff_pixels: u64,
    /// diff_pixels / total_pixels in [0, 1].
    pub diff_pct: f64,
    /// Structural similarity in [0, 1].
    pub ssim: f64,
}

/// Diff metrics scoped to a single region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDiff {
    pub name: String,
    pub selector: String,
    pub diff_pct: f64,
    pub ssim: f64,
    pub severity: Severity,
    pub bounding_box: BoundingBox,
    pub pixel_count: u64,
    pub weight: f64,
    /// Optional label attached by semantic analysis.
    pub classification: Option<String>,
}

/// Final verdict for a comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallVerdict {
    pub severity: Severity,
    pub pass: bool,
    /// max(0, 1 − diff_pct) × (0.5 + 0.5 × ssim), clamped to [0, 1].
    pub composite_score: f64,
    pub confidence: f64,
}

/// Paths of rendered artifacts for a comparison.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffArtifacts {
    pub diff_image: Option<PathBuf>,
    pub overlay_image: Option<PathBuf>,
    pub heatmap: Option<PathBuf>,
    pub metadata: Option<PathBuf>,
}

/// Complete result of one comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub pixel: PixelDiffSummary,
    pub regions: Vec<RegionDiff>,
    /// Regions whose selector failed to resolve; they are reported rather
    /// than aborting the comparison.
    pub skipped_regions: Vec<String>,
    /// Semantic classification, filled in by the runner when enabled.
    pub semantic: Option<VisionClassification>,
    /// Set when semantic analysis was requested but the budget circuit
    /// breaker made it unavailable.
    pub semantic_unavailable: bool,
    pub overall: OverallVerdict,
    pub artifacts: DiffArtifacts,
    /// Set when the sampling stage returned a verdict without a full diff.
    pub early_exit: bool,
    pub processing_time_ms: u64,
}

impl DiffResult {
    /// Result for byte-identical inputs.
    pub fn identical(total_pixels: u64) -> Self {
        Self {
            pixel: PixelDiffSummary {
                total_pixels,
                diff_pixels: 0,
                diff_pct: 0.0,
                ssim: 1.0,
            },
            regions: Vec::new(),
            skipped_regions: Vec::new(),
            semantic: None,
            semantic_unavailable: false,
            overall: OverallVerdict {
                severity: Severity::None,
                pass: true,
                composite_score: 1.0,
                confidence: 1.0,
            },
            artifacts: DiffArtifacts::default(),
            early_exit: false,
            processing_time_ms: 0,
        }
    }
}

/// Severity from frame-level metrics only, used for regions and as the
/// base for the global rule sequence.
fn classify_metrics(diff_pct: f64, ssim: f64) -> Severity {
    if diff_pct < 0.008 && ssim >= 0.95 {
        Severity::None
    } else if (0.008..=0.02).contains(&diff_pct) {
        Severity::Minor
    } else if diff_pct > 0.02 || ssim < 0.92 {
        Severity::Moderate
    } else {
        Severity::Minor
    }
}

/// Global severity rule sequence. A high-weight region in bad shape
/// escalates to breaking before the minor band applies.
fn classify_global(diff_pct: f64, ssim: f64, regions: &[RegionDiff]) -> Severity {
    if diff_pct < 0.008 && ssim >= 0.95 {
        return Severity::None;
    }
    let heavy_region_broken = regions
        .iter()
        .any(|r| r.weight >= 1.5 && (r.diff_pct > 0.01 || r.ssim < 0.92));
    if heavy_region_broken {
        return Severity::Breaking;
    }
    if (0.008..=0.02).contains(&diff_pct) {
        return Severity::Minor;
    }
    if diff_pct > 0.02 || ssim < 0.92 {
        return Severity::Moderate;
    }
    Severity::Minor
}

fn composite_score(diff_pct: f64, ssim: f64) -> f64 {
    ((1.0 - diff_pct).max(0.0) * (0.5 + 0.5 * ssim)).clamp(0.0, 1.0)
}

fn crop(image: &RgbaImage, bounds: &BoundingBox) -> RgbaImage {
    image::imageops::crop_imm(image, bounds.x, bounds.y, bounds.width, bounds.height).to_image()
}

/// The diff engine. Holds only the bounded result cache; all comparison
/// state is per-call.
pub struct DiffEngine {
    cache: DiffCache,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffEngine {
    pub fn new() -> Self {
        Self {
            cache: DiffCache::new(),
        }
    }

    /// Compare two encoded images.
    ///
    /// # Errors
    ///
    /// [`SnapError::ImageDecode`] on malformed bytes and
    /// [`SnapError::DimensionMismatch`] when dimensions differ beyond
    /// `options.dimension_tolerance`. Region resolution failures never
    /// fail the comparison; they surface in `skipped_regions`.
    pub fn compare(
        &self,
        baseline: &[u8],
        current: &[u8],
        options: &DiffOptions,
        resolver: Option<&dyn RegionResolver>,
    ) -> Result<DiffResult> {
        self.compare_with_artifacts(baseline, current, options, resolver, None)
    }

    /// Compare and, when `artifact_dir` is given, render diff / overlay /
    /// heatmap PNGs plus a metadata JSON into it.
    pub fn compare_with_artifacts(
        &self,
        baseline: &[u8],
        current: &[u8],
        options: &DiffOptions,
        resolver: Option<&dyn RegionResolver>,
        artifact_dir: Option<&Path>,
    ) -> Result<DiffResult> {
        options.validate()?;
        let started = Instant::now();

        let baseline_hash = ImageHash::from_bytes(baseline);
        let current_hash = ImageHash::from_bytes(current);

        // Identity short-circuit: equal bytes never touch the decoder.
        if baseline_hash == current_hash {
            let decoded = image::load_from_memory(baseline)
                .map_err(|e| SnapError::ImageDecode(e.to_string()))?;
            let total = u64::from(decoded.width()) * u64::from(decoded.height());
            let mut result = DiffResult::identical(total);
            result.processing_time_ms = started.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let cache_key = DiffCacheKey {
            baseline: baseline_hash,
            current: current_hash,
            options_fingerprint: options.fingerprint(),
        };
        if let Some(mut cached) = self.cache.get(&cache_key) {
            cached.processing_time_ms = started.elapsed().as_millis() as u64;
            return Ok(cached);
        }

        let baseline_img = image::load_from_memory(baseline)
            .map_err(|e| SnapError::ImageDecode(e.to_string()))?
            .to_rgba8();
        let current_img = image::load_from_memory(current)
            .map_err(|e| SnapError::ImageDecode(e.to_string()))?
            .to_rgba8();

        let (baseline_img, current_img) =
            align_dimensions(baseline_img, current_img, options.dimension_tolerance)?;

        // Early-exit sampling: a small reproducible sample showing massive
        // divergence skips the full pipeline.
        let seed = pixel::sampling_seed(&baseline_hash, &current_hash);
        let sampled_ratio = pixel::sample_diff_ratio(
            &baseline_img,
            &current_img,
            options.pixel_threshold,
            SAMPLE_FRACTION,
            seed,
        );
        if sampled_ratio > EARLY_EXIT_RATIO {
            let total =
                u64::from(baseline_img.width()) * u64::from(baseline_img.height());
            let result = DiffResult {
                pixel: PixelDiffSummary {
                    total_pixels: total,
                    diff_pixels: (sampled_ratio * total as f64).round() as u64,
                    diff_pct: sampled_ratio,
                    ssim: 0.0,
                },
                regions: Vec::new(),
                skipped_regions: Vec::new(),
                semantic: None,
                semantic_unavailable: false,
                overall: OverallVerdict {
                    severity: Severity::Breaking,
                    pass: false,
                    composite_score: composite_score(sampled_ratio, 0.0),
                    confidence: 0.95,
                },
                artifacts: DiffArtifacts::default(),
                early_exit: true,
                processing_time_ms: started.elapsed().as_millis() as u64,
            };
            self.cache.insert(cache_key, result.clone(), estimate_size(&result));
            return Ok(result);
        }

        let comparison = pixel::compare_pixels(
            &baseline_img,
            &current_img,
            options.pixel_threshold,
            options.ignore_antialiasing,
        );
        let structural = ssim::structural_similarity(&baseline_img, &current_img)?;

        let (regions, skipped_regions) = self.compare_regions(
            &baseline_img,
            &current_img,
            options,
            resolver,
        );

        let severity = classify_global(comparison.diff_pct, structural.score, &regions);
        let overall = OverallVerdict {
            severity,
            pass: severity <= Severity::Minor,
            composite_score: composite_score(comparison.diff_pct, structural.score),
            confidence: 0.75,
        };

        let mut result = DiffResult {
            pixel: PixelDiffSummary {
                total_pixels: comparison.total_pixels,
                diff_pixels: comparison.diff_pixels,
                diff_pct: comparison.diff_pct,
                ssim: structural.score,
            },
            regions,
            skipped_regions,
            semantic: None,
            semantic_unavailable: false,
            overall,
            artifacts: DiffArtifacts::default(),
            early_exit: false,
            processing_time_ms: 0,
        };

        let mut artifact_bytes = 0usize;
        if let Some(dir) = artifact_dir {
            let rendered = artifacts::render(
                &baseline_img,
                &current_img,
                &comparison.diff_mask,
                &structural.map,
            )?;
            artifact_bytes = rendered.total_bytes();
            result.artifacts = write_artifacts(dir, &current_hash, &rendered, &result)?;
        }

        result.processing_time_ms = started.elapsed().as_millis() as u64;
        self.cache.insert(
            cache_key,
            result.clone(),
            estimate_size(&result) + artifact_bytes,
        );
        Ok(result)
    }

    fn compare_regions(
        &self,
        baseline: &RgbaImage,
        current: &RgbaImage,
        options: &DiffOptions,
        resolver: Option<&dyn RegionResolver>,
    ) -> (Vec<RegionDiff>, Vec<String>) {
        let mut regions = Vec::new();
        let mut skipped = Vec::new();

        for spec in &options.regions {
            let resolved = resolver.and_then(|r| r.resolve(&spec.selector));
            let Some(bounds) = resolved else {
                tracing::debug!(region = %spec.name, selector = %spec.selector, "region selector did not resolve");
                skipped.push(spec.name.clone());
                continue;
            };
            let Some(bounds) = bounds.clamp_to(baseline.width(), baseline.height()) else {
                skipped.push(spec.name.clone());
                continue;
            };

            let base_crop = crop(baseline, &bounds);
            let curr_crop = crop(current, &bounds);

            let comparison = pixel::compare_pixels(
                &base_crop,
                &curr_crop,
                options.pixel_threshold,
                options.ignore_antialiasing,
            );
            let ssim_score = match ssim::structural_similarity(&base_crop, &curr_crop) {
                Ok(s) => s.score,
                Err(_) => {
                    // Degenerate crops (thinner than the SSIM window) fall
                    // back to a pixel-only score.
                    1.0 - comparison.diff_pct
                }
            };

            // A region inherits the higher of its own severity and its
            // weight-scaled severity.
            let own = classify_metrics(comparison.diff_pct, ssim_score);
            let weighted =
                classify_metrics((comparison.diff_pct * spec.weight).min(1.0), ssim_score);
            let severity = own.max(weighted);

            regions.push(RegionDiff {
                name: spec.name.clone(),
                selector: spec.selector.clone(),
                diff_pct: comparison.diff_pct,
                ssim: ssim_score,
                severity,
                bounding_box: bounds,
                pixel_count: comparison.diff_pixels,
                weight: spec.weight,
                classification: None,
            });
        }

        (regions, skipped)
    }

    /// Hit/miss statistics for the result cache.
    pub fn cache_stats(&self) -> DiffCacheStats {
        self.cache.stats()
    }

    /// Memory accounting for the result cache.
    pub fn memory_stats(&self) -> DiffMemoryStats {
        self.cache.memory_stats()
    }

    /// Drop all cached comparisons.
    pub fn clear_cache(&self) {
        self.cache.clear()
    }
}

/// Enforce the dimension tolerance and align both frames on their common
/// intersection when a nonzero tolerance admits a small delta.
fn align_dimensions(
    baseline: RgbaImage,
    current: RgbaImage,
    tolerance: u32,
) -> Result<(RgbaImage, RgbaImage)> {
    let (bw, bh) = baseline.dimensions();
    let (cw, ch) = current.dimensions();
    if bw == cw && bh == ch {
        return Ok((baseline, current));
    }
    if bw.abs_diff(cw) > tolerance || bh.abs_diff(ch) > tolerance {
        return Err(SnapError::DimensionMismatch {
            baseline_width: bw,
            baseline_height: bh,
            current_width: cw,
            current_height: ch,
        });
    }
    let w = bw.min(cw);
    let h = bh.min(ch);
    let bounds = BoundingBox {
        x: 0,
        y: 0,
        width: w,
        height: h,
    };
    Ok((crop(&baseline, &bounds), crop(&current, &bounds)))
}

fn estimate_size(result: &DiffResult) -> usize {
    serde_json::to_vec(result).map(|v| v.len()).unwrap_or(1024)
}

fn write_artifacts(
    dir: &Path,
    current_hash: &ImageHash,
    rendered: &artifacts::RenderedArtifacts,
    result: &DiffResult,
) -> Result<DiffArtifacts> {
    std::fs::create_dir_all(dir)
        .map_err(|e| SnapError::Storage(format!("cannot create {}: {e}", dir.display())))?;
    let stem = &current_hash.to_hex()[..12];

    let diff_path = dir.join(format!("{stem}-diff.png"));
    let overlay_path = dir.join(format!("{stem}-overlay.png"));
    let heatmap_path = dir.join(format!("{stem}-heatmap.png"));
    let metadata_path = dir.join(format!("{stem}-metadata.json"));

    std::fs::write(&diff_path, &rendered.diff_image)?;
    std::fs::write(&overlay_path, &rendered.overlay_image)?;
    std::fs::write(&heatmap_path, &rendered.heatmap)?;
    std::fs::write(&metadata_path, serde_json::to_vec_pretty(result)?)?;

    Ok(DiffArtifacts {
        diff_image: Some(diff_path),
        overlay_image: Some(overlay_path),
        heatmap: Some(heatmap_path),
        metadata: Some(metadata_path),
    })
}
