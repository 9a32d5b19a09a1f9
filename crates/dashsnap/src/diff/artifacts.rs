//! Diff artifact rendering: highlight image, side-by-side composite, and
//! the SSIM heatmap.

use image::codecs::png::PngEncoder;
use image::{GrayImage, ImageBuffer, ImageEncoder, Rgba, RgbaImage};

use crate::error::{Result, SnapError};

const SEPARATOR_WIDTH: u32 = 4;
const CANVAS_BG: Rgba<u8> = Rgba([24, 24, 24, 255]);
const SEPARATOR_FILL: Rgba<u8> = Rgba([54, 54, 54, 255]);

/// Encoded PNG artifacts produced for a comparison.
#[derive(Debug, Clone, Default)]
pub(crate) struct RenderedArtifacts {
    /// Current image with differing pixels tinted red.
    pub diff_image: Vec<u8>,
    /// Baseline | current | highlight composite.
    pub overlay_image: Vec<u8>,
    /// Grayscale dissimilarity heatmap from the SSIM window map.
    pub heatmap: Vec<u8>,
}

impl RenderedArtifacts {
    pub fn total_bytes(&self) -> usize {
        self.diff_image.len() + self.overlay_image.len() + self.heatmap.len()
    }
}

pub(crate) fn encode_rgba_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgba8,
        )
        .map_err(|e| SnapError::ImageEncode(format!("failed to encode PNG: {e}")))?;
    Ok(buffer)
}

fn encode_gray_png(image: &GrayImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::L8,
        )
        .map_err(|e| SnapError::ImageEncode(format!("failed to encode PNG: {e}")))?;
    Ok(buffer)
}

/// Tint differing pixels red over the current image.
fn build_highlight_view(current: &RgbaImage, diff_mask: &[bool]) -> RgbaImage {
    let (width, height) = current.dimensions();
    let mut tinted = RgbaImage::new(width, height);

    for y in 0..height {
        for x in 0..width {
            let px = current.get_pixel(x, y).0;
            let differs = diff_mask[(y as usize) * (width as usize) + (x as usize)];
            if differs {
                let red = px[0].saturating_add(160).max(200);
                let green = (f32::from(px[1]) * 0.25) as u8;
                let blue = (f32::from(px[2]) * 0.25) as u8;
                tinted.put_pixel(x, y, Rgba([red, green, blue, 255]));
            } else {
                tinted.put_pixel(x, y, Rgba([px[0], px[1], px[2], 255]));
            }
        }
    }

    tinted
}

fn blit_image(target: &mut RgbaImage, source: &RgbaImage, offset_x: u32) {
    for (x, y, pixel) in source.enumerate_pixels() {
        target.put_pixel(offset_x + x, y, *pixel);
    }
}

fn fill_separator(image: &mut RgbaImage, start_x: u32, height: u32) {
    for dx in 0..SEPARATOR_WIDTH {
        for y in 0..height {
            image.put_pixel(start_x + dx, y, SEPARATOR_FILL);
        }
    }
}

/// Baseline | current | highlight, separated by thin gutters.
fn build_composite(
    baseline: &RgbaImage,
    current: &RgbaImage,
    highlight: &RgbaImage,
) -> RgbaImage {
    let (width, height) = baseline.dimensions();
    let total_width = width * 3 + SEPARATOR_WIDTH * 2;
    let mut canvas = ImageBuffer::from_pixel(total_width, height, CANVAS_BG);

    blit_image(&mut canvas, baseline, 0);
    fill_separator(&mut canvas, width, height);
    blit_image(&mut canvas, current, width + SEPARATOR_WIDTH);
    fill_separator(&mut canvas, width * 2 + SEPARATOR_WIDTH, height);
    blit_image(&mut canvas, highlight, width * 2 + SEPARATOR_WIDTH * 2);

    canvas
}

/// Invert the SSIM similarity map so hot spots read as bright.
fn build_heatmap(ssim_map: &GrayImage) -> GrayImage {
    let mut heat = GrayImage::new(ssim_map.width(), ssim_map.height());
    for (x, y, px) in ssim_map.enumerate_pixels() {
        heat.put_pixel(x, y, image::Luma([255 - px.0[0]]));
    }
    heat
}

/// Render all artifacts for a completed comparison.
pub(crate) fn render(
    baseline: &RgbaImage,
    current: &RgbaImage,
    diff_mask: &[bool],
    ssim_map: &GrayImage,
) -> Result<RenderedArtifacts> {
    let highlight = build_highlight_view(current, diff_mask);
    let composite = build_composite(baseline, current, &highlight);
    let heatmap = build_heatmap(ssim_map);

    Ok(RenderedArtifacts {
        diff_image: encode_rgba_png(&highlight)?,
        overlay_image: encode_rgba_png(&composite)?,
        heatmap: encode_gray_png(&heatmap)?,
    })
}
