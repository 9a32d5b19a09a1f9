//! Deterministic PNG fixtures for diff-engine scenarios.

use image::codecs::png::PngEncoder;
use image::{ImageEncoder, Rgba, RgbaImage};

fn encode(img: &RgbaImage) -> Vec<u8> {
    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            image::ExtendedColorType::Rgba8,
        )
        .unwrap();
    buffer
}

/// A solid-color PNG.
pub fn solid_png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
    encode(&RgbaImage::from_pixel(width, height, Rgba(color)))
}

/// A solid PNG with the top `rows` rows painted in `stripe_color`.
/// Useful for dialing in an exact diff percentage: `rows / height`.
pub fn striped_png(
    width: u32,
    height: u32,
    base_color: [u8; 4],
    stripe_color: [u8; 4],
    rows: u32,
) -> Vec<u8> {
    let mut img = RgbaImage::from_pixel(width, height, Rgba(base_color));
    for y in 0..rows.min(height) {
        for x in 0..width {
            img.put_pixel(x, y, Rgba(stripe_color));
        }
    }
    encode(&img)
}

/// A PNG with a filled rectangle over a solid background.
pub fn rect_png(
    width: u32,
    height: u32,
    base_color: [u8; 4],
    rect_color: [u8; 4],
    rect: (u32, u32, u32, u32),
) -> Vec<u8> {
    let (rx, ry, rw, rh) = rect;
    let mut img = RgbaImage::from_pixel(width, height, Rgba(base_color));
    for y in ry..(ry + rh).min(height) {
        for x in rx..(rx + rw).min(width) {
            img.put_pixel(x, y, Rgba(rect_color));
        }
    }
    encode(&img)
}

/// A checkerboard PNG; paired with its inverse it produces a ~100% diff.
pub fn checkerboard_png(width: u32, height: u32, cell: u32, invert: bool) -> Vec<u8> {
    let mut img = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let on = ((x / cell.max(1)) + (y / cell.max(1))) % 2 == 0;
            let on = on ^ invert;
            let value = if on { 230 } else { 25 };
            img.put_pixel(x, y, Rgba([value, value, value, 255]));
        }
    }
    encode(&img)
}
