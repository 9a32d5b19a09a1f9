//! Image preprocessing for AI transport and cache keying.
//!
//! Providers accept bounded payloads, so raw captures are normalized before
//! they leave the process: decode, fit-inside resize without enlargement,
//! re-encode to a transport format, hash, and base64-encode. The hash of the
//! normalized bytes is what every downstream cache keys on.

use crate::error::{Result, SnapError};
use crate::hash::ImageHash;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageEncoder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transport format for normalized images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportFormat {
    /// Lossy JPEG, the default transport form.
    Jpeg,
    /// Lossless PNG at maximum compression.
    Png,
    /// Lossless WebP.
    WebP,
}

impl TransportFormat {
    /// MIME type for data-URL construction.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::WebP => "image/webp",
        }
    }
}

/// Preprocessor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Maximum output width; larger inputs are resized to fit.
    pub max_width: u32,
    /// Maximum output height; larger inputs are resized to fit.
    pub max_height: u32,
    /// Target encoding.
    pub format: TransportFormat,
    /// JPEG quality (ignored for lossless formats).
    pub quality: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_width: 2048,
            max_height: 2048,
            format: TransportFormat::Jpeg,
            quality: 85,
        }
    }
}

/// Input accepted by the preprocessor.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// Raw encoded bytes.
    Bytes(Vec<u8>),
    /// Base64 text, with or without a `data:image/...;base64,` prefix.
    Base64(String),
    /// Filesystem path to an encoded image.
    Path(PathBuf),
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<&[u8]> for ImageInput {
    fn from(bytes: &[u8]) -> Self {
        Self::Bytes(bytes.to_vec())
    }
}

/// A normalized image ready for provider transport.
#[derive(Debug, Clone)]
pub struct PreprocessedImage {
    /// Normalized encoded bytes.
    pub bytes: Vec<u8>,
    /// Base64 transport form of `bytes`.
    pub base64: String,
    /// SHA-256 over `bytes`; reused by every cache layer.
    pub hash: ImageHash,
    /// Encoding of `bytes`.
    pub format: TransportFormat,
    /// Input size in bytes before normalization.
    pub original_size: usize,
    /// Output size in bytes.
    pub processed_size: usize,
    /// Final width.
    pub width: u32,
    /// Final height.
    pub height: u32,
}

impl PreprocessedImage {
    /// Size reduction as a percentage of the original (informational only).
    pub fn reduction_pct(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        let saved = self.original_size.saturating_sub(self.processed_size);
        (saved as f64 / self.original_size as f64) * 100.0
    }

    /// Data-URL form for providers that take `image_url` parts.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.format.mime_type(), self.base64)
    }
}

/// Normalizes images for AI transport: decode, bounded resize, re-encode,
/// hash, base64.
///
/// # Example
///
/// ```no_run
/// use dashsnap::preprocess::{ImagePreprocessor, PreprocessConfig};
///
/// let preprocessor = ImagePreprocessor::new(PreprocessConfig::default());
/// let png = std::fs::read("capture.png").unwrap();
/// let processed = preprocessor.preprocess(png.into()).unwrap();
/// println!("{} -> {} bytes ({:.1}% smaller)",
///     processed.original_size, processed.processed_size, processed.reduction_pct());
/// ```
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    /// Create a preprocessor with the given configuration.
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    /// Create a preprocessor with default JPEG-q85 / 2048x2048 settings.
    pub fn with_defaults() -> Self {
        Self::new(PreprocessConfig::default())
    }

    /// Normalize an input image.
    ///
    /// # Errors
    ///
    /// Returns [`SnapError::ImageDecode`] on malformed input and
    /// [`SnapError::ImageEncode`] on sink failure. Never retries.
    pub fn preprocess(&self, input: ImageInput) -> Result<PreprocessedImage> {
        let raw = self.resolve_input(input)?;
        let original_size = raw.len();

        let decoded = image::load_from_memory(&raw)
            .map_err(|e| SnapError::ImageDecode(e.to_string()))?;

        let resized = self.fit_inside(decoded);
        let (width, height) = (resized.width(), resized.height());

        let bytes = self.encode(&resized)?;
        let hash = ImageHash::from_bytes(&bytes);
        let base64 = BASE64.encode(&bytes);
        let processed_size = bytes.len();

        Ok(PreprocessedImage {
            bytes,
            base64,
            hash,
            format: self.config.format,
            original_size,
            processed_size,
            width,
            height,
        })
    }

    fn resolve_input(&self, input: ImageInput) -> Result<Vec<u8>> {
        match input {
            ImageInput::Bytes(bytes) => Ok(bytes),
            ImageInput::Base64(text) => {
                // Tolerate a data-URL prefix: everything after the first comma
                let payload = match text.split_once(',') {
                    Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                    _ => text.as_str(),
                };
                BASE64
                    .decode(payload.trim())
                    .map_err(|e| SnapError::ImageDecode(format!("invalid base64: {e}")))
            }
            ImageInput::Path(path) => std::fs::read(&path).map_err(|e| {
                SnapError::ImageDecode(format!("cannot read {}: {e}", path.display()))
            }),
        }
    }

    /// Aspect-preserving fit-inside without enlargement.
    fn fit_inside(&self, img: DynamicImage) -> DynamicImage {
        if img.width() <= self.config.max_width && img.height() <= self.config.max_height {
            return img;
        }
        img.resize(
            self.config.max_width,
            self.config.max_height,
            FilterType::CatmullRom,
        )
    }

    fn encode(&self, img: &DynamicImage) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        match self.config.format {
            TransportFormat::Jpeg => {
                // JPEG has no alpha channel
                let rgb = img.to_rgb8();
                JpegEncoder::new_with_quality(&mut buffer, self.config.quality)
                    .write_image(
                        rgb.as_raw(),
                        rgb.width(),
                        rgb.height(),
                        image::ExtendedColorType::Rgb8,
                    )
                    .map_err(|e| SnapError::ImageEncode(e.to_string()))?;
            }
            TransportFormat::Png => {
                let rgba = img.to_rgba8();
                PngEncoder::new_with_quality(
                    &mut buffer,
                    CompressionType::Best,
                    PngFilterType::Adaptive,
                )
                .write_image(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    image::ExtendedColorType::Rgba8,
                )
                .map_err(|e| SnapError::ImageEncode(e.to_string()))?;
            }
            TransportFormat::WebP => {
                let rgba = img.to_rgba8();
                WebPEncoder::new_lossless(&mut buffer)
                    .encode(
                        rgba.as_raw(),
                        rgba.width(),
                        rgba.height(),
                        image::ExtendedColorType::Rgba8,
                    )
                    .map_err(|e| SnapError::ImageEncode(e.to_string()))?;
            }
        }
        Ok(buffer)
    }
}
