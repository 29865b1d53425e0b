//! Shared test utilities for the imagemill test suite.
//!
//! Synthetic images with known structure, so assertions can talk about exact
//! borders and colors without fixture files.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! // 7px white frame around busy content
//! let img = bordered(100, 80, [7, 7, 7, 7], [255, 255, 255, 255]);
//! let png = encode_png(&img);
//! ```

use image::{DynamicImage, Rgba, RgbImage, RgbaImage};

use crate::imaging::{EncodedImage, RasterImage};
use crate::types::ImageFormat;

// =========================================================================
// Pixel builders
// =========================================================================

/// Every pixel the same color.
pub fn solid_rgba(width: u32, height: u32, color: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba(color))
}

/// Smooth opaque gradient, red along x and green along y.
pub fn gradient_rgb(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            128,
        ])
    })
}

/// High-variance opaque content: no row or column is close to uniform.
pub fn busy_rgba(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_fn(width, height, |x, y| busy_pixel(x, y))
}

fn busy_pixel(x: u32, y: u32) -> Rgba<u8> {
    Rgba([
        ((x * 37 + y * 91) % 256) as u8,
        ((x * 53 + y * 29) % 256) as u8,
        ((x * 17 + y * 61 + 128) % 256) as u8,
        255,
    ])
}

/// Busy content framed by a solid border.
///
/// `widths` is `[top, right, bottom, left]`.
pub fn bordered(width: u32, height: u32, widths: [u32; 4], color: [u8; 4]) -> RgbaImage {
    let [top, right, bottom, left] = widths;
    RgbaImage::from_fn(width, height, |x, y| {
        let in_border = y < top || y >= height - bottom || x < left || x >= width - right;
        if in_border {
            Rgba(color)
        } else {
            busy_pixel(x, y)
        }
    })
}

// =========================================================================
// Wrappers
// =========================================================================

pub fn raster_of(img: RgbaImage) -> RasterImage {
    RasterImage::new(DynamicImage::ImageRgba8(img))
}

/// Encode RGBA pixels as PNG.
pub fn encode_png(img: &RgbaImage) -> EncodedImage {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    EncodedImage::new(buf, ImageFormat::Png)
}
