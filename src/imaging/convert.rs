//! Format conversion between JPEG, PNG, WebP and AVIF, plus SVG rasterization.
//!
//! Alpha is carried over when the target can store it and composited onto
//! `background` when it can't. SVG is accepted as a source only; asking for
//! SVG output is an [`ProcessingError::UnsupportedConversion`].

use super::codec::{
    EncodedImage, LimitSettings, decode_within, encode_pixels, prepare_for, rasterize_svg,
    svg_dimensions,
};
use super::params::{Quality, Rgb};
use crate::error::ProcessingError;
use crate::types::{Dimensions, ImageFormat};

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Pixel width for rasterizing vector sources. Natural size when `None`.
    pub raster_width: Option<u32>,
    /// Fill for translucent pixels when the target has no alpha channel.
    pub background: Rgb,
    pub quality: Quality,
    pub limits: LimitSettings,
}

#[derive(Debug, Clone)]
pub struct ConvertOutput {
    pub image: EncodedImage,
    pub before: Dimensions,
    pub after: Dimensions,
}

pub fn convert(
    source: &EncodedImage,
    target: ImageFormat,
    options: &ConvertOptions,
) -> Result<ConvertOutput, ProcessingError> {
    if target.is_vector() {
        return Err(ProcessingError::UnsupportedConversion {
            from: source.format,
            to: target,
        });
    }

    let (raster, before) = if source.format.is_vector() {
        let raster = rasterize_svg(&source.bytes, options.raster_width, &options.limits)?;
        (raster, svg_dimensions(&source.bytes)?)
    } else {
        let raster = decode_within(source, &options.limits)?;
        let dims = raster.dimensions();
        (raster, dims)
    };

    let pixels = prepare_for(&raster, target, options.background);
    let image = encode_pixels(&pixels, target, options.quality)?;
    Ok(ConvertOutput {
        image,
        before,
        after: raster.dimensions(),
    })
}
