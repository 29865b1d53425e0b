//! Codec adapter: encoded bytes ↔ in-memory raster.
//!
//! Pure functions, no shared state. Every other imaging module goes through
//! here to get pixels in and bytes out.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, WebP) | `image` crate (pure Rust decoders) |
//! | Decode (AVIF) | `avif-parse` (container) + `rav1d` (AV1 decode) + BT.601 YUV→RGB |
//! | Rasterize (SVG) | `resvg` (usvg parse, tiny-skia render) |
//! | Encode → JPEG | `JpegEncoder::new_with_quality` |
//! | Encode → PNG | `PngEncoder::new_with_quality` (compression level from quality) |
//! | Encode → WebP | `WebPEncoder::new_lossless` |
//! | Encode → AVIF | `AvifEncoder::new_with_speed_quality` (rav1e, speed 6) |
//!
//! Undecodable bytes of a recognized format are an `EncodingFailure`; bytes
//! whose format can't be recognized at all are `InvalidInput`.
//!
//! Every raster is checked against [`LimitSettings`] before its pixels are
//! allocated: header dimensions for JPEG/PNG/WebP, the rav1d frame size
//! limit for AVIF, the computed pixmap size for SVG.

use super::calculations::{fits_pixel_budget, raster_dimensions};
use super::params::{Quality, Rgb};
use crate::cache::hash_bytes;
use crate::error::ProcessingError;
use crate::types::{Dimensions, ImageFormat};
use image::codecs::png::{CompressionType, FilterType as PngFilter};
use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::ptr::NonNull;

/// Encoder effort for AVIF. 6 keeps rav1e throughput reasonable.
const AVIF_SPEED: u8 = 6;

/// Largest raster, in pixels, unless configured otherwise (100 megapixels).
pub const DEFAULT_MAX_PIXELS: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitSettings {
    /// Largest raster any decode, rasterize or upscale may produce.
    pub max_output_pixels: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_output_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl LimitSettings {
    /// Refuse a `width` x `height` raster before anything is allocated for it.
    pub fn check(&self, width: u32, height: u32) -> Result<(), ProcessingError> {
        if fits_pixel_budget(width, height, self.max_output_pixels) {
            Ok(())
        } else {
            Err(ProcessingError::invalid(format!(
                "{width}x{height} exceeds the limit of {} pixels",
                self.max_output_pixels
            )))
        }
    }

    /// The same bound in the form rav1d takes (0 would mean unlimited).
    fn frame_size_limit(&self) -> u32 {
        u32::try_from(self.max_output_pixels)
            .unwrap_or(u32::MAX)
            .max(1)
    }
}

/// Color space of decoded pixels. All output is encoded as 8-bit sRGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Srgb,
    Gray,
}

/// A decoded pixel buffer.
///
/// Immutable once built: each pipeline stage produces a new raster instead
/// of editing one in place.
#[derive(Debug, Clone)]
pub struct RasterImage {
    pixels: DynamicImage,
    color_space: ColorSpace,
}

impl RasterImage {
    pub fn new(pixels: DynamicImage) -> Self {
        let color_space = match pixels.color() {
            image::ColorType::L8
            | image::ColorType::La8
            | image::ColorType::L16
            | image::ColorType::La16 => ColorSpace::Gray,
            _ => ColorSpace::Srgb,
        };
        Self {
            pixels,
            color_space,
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.width(),
            height: self.height(),
        }
    }

    pub fn channels(&self) -> u8 {
        self.pixels.color().channel_count()
    }

    pub fn has_alpha(&self) -> bool {
        self.pixels.color().has_alpha()
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color_space
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn to_rgba8(&self) -> RgbaImage {
        self.pixels.to_rgba8()
    }
}

/// Encoded bytes tagged with their format and content checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub format: ImageFormat,
    pub checksum: String,
}

impl EncodedImage {
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        let checksum = hash_bytes(&bytes);
        Self {
            bytes,
            format,
            checksum,
        }
    }

    /// Wrap bytes whose format is sniffed from their header.
    pub fn detect(bytes: Vec<u8>) -> Result<Self, ProcessingError> {
        let format = ImageFormat::detect(&bytes)
            .ok_or_else(|| ProcessingError::invalid("unrecognized image format"))?;
        Ok(Self::new(bytes, format))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn raster_format(format: ImageFormat) -> Option<image::ImageFormat> {
    match format {
        ImageFormat::Jpeg => Some(image::ImageFormat::Jpeg),
        ImageFormat::Png => Some(image::ImageFormat::Png),
        ImageFormat::WebP => Some(image::ImageFormat::WebP),
        ImageFormat::Avif | ImageFormat::Svg => None,
    }
}

/// Decode an encoded image into a raster under the default pixel limit.
///
/// SVG sources are rasterized at their natural size; use
/// [`rasterize_svg`] to pick a resolution.
pub fn decode(source: &EncodedImage) -> Result<RasterImage, ProcessingError> {
    decode_within(source, &LimitSettings::default())
}

/// Decode an encoded image, refusing anything larger than `limits` allows.
pub fn decode_within(
    source: &EncodedImage,
    limits: &LimitSettings,
) -> Result<RasterImage, ProcessingError> {
    if source.is_empty() {
        return Err(ProcessingError::invalid("empty image data"));
    }
    let raster = match source.format {
        ImageFormat::Svg => return rasterize_svg(&source.bytes, None, limits),
        ImageFormat::Avif => decode_avif(&source.bytes, limits)?,
        other => {
            let fmt = raster_format(other).ok_or_else(|| {
                ProcessingError::invalid(format!("no decoder for {other}"))
            })?;
            let failed = |e: image::ImageError| {
                ProcessingError::encoding(format!("failed to decode {other}: {e}"))
            };
            let (width, height) = image::ImageReader::with_format(Cursor::new(&source.bytes), fmt)
                .into_dimensions()
                .map_err(failed)?;
            limits.check(width, height)?;
            image::load_from_memory_with_format(&source.bytes, fmt).map_err(failed)?
        }
    };
    if raster.width() == 0 || raster.height() == 0 {
        return Err(ProcessingError::invalid("image has zero area"));
    }
    Ok(RasterImage::new(raster))
}

/// Rasterize SVG markup, optionally at a fixed pixel width.
///
/// The height follows the aspect ratio, so a narrow, tall drawing at a large
/// width can exceed `limits` even when the width alone is fine.
pub fn rasterize_svg(
    bytes: &[u8],
    width: Option<u32>,
    limits: &LimitSettings,
) -> Result<RasterImage, ProcessingError> {
    use resvg::{tiny_skia, usvg};

    let options = usvg::Options::default();
    let tree = usvg::Tree::from_data(bytes, &options)
        .map_err(|e| ProcessingError::invalid(format!("failed to parse SVG: {e}")))?;
    let size = tree.size();
    let (w, h, scale) = raster_dimensions((size.width(), size.height()), width);
    limits.check(w, h)?;

    let mut pixmap = tiny_skia::Pixmap::new(w, h)
        .ok_or_else(|| ProcessingError::invalid(format!("cannot rasterize SVG at {w}x{h}")))?;
    resvg::render(
        &tree,
        tiny_skia::Transform::from_scale(scale, scale),
        &mut pixmap.as_mut(),
    );

    // tiny-skia stores premultiplied alpha; the rest of the engine doesn't.
    let mut rgba = Vec::with_capacity((w as usize) * (h as usize) * 4);
    for px in pixmap.pixels() {
        let c = px.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    RgbaImage::from_raw(w, h, rgba)
        .map(|img| RasterImage::new(DynamicImage::ImageRgba8(img)))
        .ok_or_else(|| ProcessingError::Internal("SVG pixmap size mismatch".into()))
}

/// Natural pixel size of SVG markup, rounded.
pub fn svg_dimensions(bytes: &[u8]) -> Result<Dimensions, ProcessingError> {
    use resvg::usvg;

    let tree = usvg::Tree::from_data(bytes, &usvg::Options::default())
        .map_err(|e| ProcessingError::invalid(format!("failed to parse SVG: {e}")))?;
    let (width, height, _) = raster_dimensions((tree.size().width(), tree.size().height()), None);
    Ok(Dimensions { width, height })
}

/// Convert pixels into what `format` can store.
///
/// Output is always 8-bit sRGB. Alpha is kept when both the source has it
/// and the target supports it; otherwise translucent pixels are composited
/// onto `background`.
pub fn prepare_for(raster: &RasterImage, format: ImageFormat, background: Rgb) -> DynamicImage {
    let pixels = raster.pixels();
    if raster.has_alpha() {
        if format.supports_alpha() {
            DynamicImage::ImageRgba8(pixels.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(flatten(&pixels.to_rgba8(), background))
        }
    } else {
        DynamicImage::ImageRgb8(pixels.to_rgb8())
    }
}

/// Composite RGBA pixels over an opaque background.
pub fn flatten(rgba: &RgbaImage, background: Rgb) -> image::RgbImage {
    image::RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = u32::from(a);
        let blend = |fg: u8, bg: u8| -> u8 {
            ((u32::from(fg) * alpha + u32::from(bg) * (255 - alpha) + 127) / 255) as u8
        };
        image::Rgb([
            blend(r, background.0[0]),
            blend(g, background.0[1]),
            blend(b, background.0[2]),
        ])
    })
}

fn png_compression(quality: Quality) -> CompressionType {
    // Lower quality asks for smaller output; PNG stays lossless either way.
    match quality.value() {
        1..=33 => CompressionType::Best,
        34..=66 => CompressionType::Default,
        _ => CompressionType::Fast,
    }
}

/// Encode prepared pixels. Callers normally go through [`encode`].
pub fn encode_pixels(
    pixels: &DynamicImage,
    format: ImageFormat,
    quality: Quality,
) -> Result<EncodedImage, ProcessingError> {
    let mut buf = Vec::new();
    let q = quality.value();
    let result = match format {
        ImageFormat::Jpeg => {
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, q);
            pixels.write_with_encoder(encoder)
        }
        ImageFormat::Png => {
            let encoder = image::codecs::png::PngEncoder::new_with_quality(
                &mut buf,
                png_compression(quality),
                PngFilter::Adaptive,
            );
            pixels.write_with_encoder(encoder)
        }
        ImageFormat::WebP => {
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut buf);
            pixels.write_with_encoder(encoder)
        }
        ImageFormat::Avif => {
            let encoder =
                image::codecs::avif::AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, q);
            pixels.write_with_encoder(encoder)
        }
        ImageFormat::Svg => {
            return Err(ProcessingError::invalid("SVG has no raster encoder"));
        }
    };
    result.map_err(|e| ProcessingError::encoding(format!("{format} encode failed: {e}")))?;
    Ok(EncodedImage::new(buf, format))
}

/// Encode a raster to `format`, converting color space and alpha first.
pub fn encode(
    raster: &RasterImage,
    format: ImageFormat,
    quality: Quality,
) -> Result<EncodedImage, ProcessingError> {
    if format.is_vector() {
        return Err(ProcessingError::invalid(format!("{format} has no raster encoder")));
    }
    let prepared = prepare_for(raster, format, Rgb::WHITE);
    encode_pixels(&prepared, format, quality)
}

/// Format to use when an operation re-encodes a source of `format`.
///
/// Vector sources have no raster encoding of their own; they come out as PNG.
pub fn output_format_for(format: ImageFormat) -> ImageFormat {
    if format.is_vector() {
        ImageFormat::Png
    } else {
        format
    }
}

// ============================================================================
// AVIF decode
// ============================================================================

/// Decode AVIF via avif-parse (container) + rav1d (AV1 decode).
///
/// The `image` crate's `"avif"` feature only provides the rav1e encoder; its
/// decoder needs the dav1d C library. `rav1d` is the pure Rust port.
///
/// An alpha item is a second, monochrome AV1 frame of the same size.
fn decode_avif(bytes: &[u8], limits: &LimitSettings) -> Result<DynamicImage, ProcessingError> {
    let avif = avif_parse::read_avif(&mut Cursor::new(bytes))
        .map_err(|e| ProcessingError::encoding(format!("failed to parse AVIF: {e:?}")))?;
    let frame_limit = limits.frame_size_limit();
    let color = decode_av1(&avif.primary_item, frame_limit, YuvPlanes::to_rgb)?;

    let Some(alpha_item) = avif.alpha_item.as_deref() else {
        return image::RgbImage::from_raw(color.width, color.height, color.samples)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| ProcessingError::encoding("decoded AVIF has inconsistent size"));
    };
    let alpha = decode_av1(alpha_item, frame_limit, YuvPlanes::to_luma)?;
    if (alpha.width, alpha.height) != (color.width, color.height) {
        return Err(ProcessingError::encoding(format!(
            "AVIF alpha is {}x{} but color is {}x{}",
            alpha.width, alpha.height, color.width, color.height
        )));
    }

    let mut rgba = Vec::with_capacity(alpha.samples.len() * 4);
    for (rgb, &a) in color.samples.chunks_exact(3).zip(&alpha.samples) {
        for &c in rgb {
            rgba.push(if avif.premultiplied_alpha {
                unpremultiply(c, a)
            } else {
                c
            });
        }
        rgba.push(a);
    }
    RgbaImage::from_raw(color.width, color.height, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| ProcessingError::encoding("decoded AVIF has inconsistent size"))
}

fn unpremultiply(c: u8, a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    ((u32::from(c) * 255 + u32::from(a) / 2) / u32::from(a)).min(255) as u8
}

/// One decoded AV1 frame, converted to interleaved 8-bit samples.
struct Frame {
    width: u32,
    height: u32,
    samples: Vec<u8>,
}

/// Decode a single AV1 frame and convert it while rav1d still owns the planes.
fn decode_av1(
    av1_bytes: &[u8],
    frame_size_limit: u32,
    convert: fn(&YuvPlanes) -> Vec<u8>,
) -> Result<Frame, ProcessingError> {
    use rav1d::include::dav1d::data::Dav1dData;
    use rav1d::include::dav1d::dav1d::Dav1dSettings;
    use rav1d::include::dav1d::headers::{
        DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
        DAV1D_PIXEL_LAYOUT_I444,
    };
    use rav1d::include::dav1d::picture::Dav1dPicture;
    use rav1d::src::lib as dav1d;

    let mut settings = std::mem::MaybeUninit::<Dav1dSettings>::uninit();
    unsafe { dav1d::dav1d_default_settings(NonNull::from(&mut settings).cast()) };
    let mut settings = unsafe { settings.assume_init() };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;
    settings.frame_size_limit = frame_size_limit;

    let mut ctx = None;
    let rc = unsafe { dav1d::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(ProcessingError::encoding(format!(
            "rav1d open failed ({})",
            rc.0
        )));
    }

    // Everything between open and close; the context is closed exactly once below.
    let decoded = (|| -> Result<Frame, ProcessingError> {
        let mut data = Dav1dData::default();
        let buf_ptr = unsafe { dav1d::dav1d_data_create(NonNull::new(&mut data), av1_bytes.len()) };
        if buf_ptr.is_null() {
            return Err(ProcessingError::encoding("rav1d data_create failed"));
        }
        unsafe { std::ptr::copy_nonoverlapping(av1_bytes.as_ptr(), buf_ptr, av1_bytes.len()) };

        let rc = unsafe { dav1d::dav1d_send_data(ctx, NonNull::new(&mut data)) };
        if rc.0 != 0 {
            unsafe { dav1d::dav1d_data_unref(NonNull::new(&mut data)) };
            return Err(ProcessingError::encoding(format!(
                "rav1d send_data failed ({})",
                rc.0
            )));
        }

        let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
        let rc = unsafe { dav1d::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
        if rc.0 != 0 {
            return Err(ProcessingError::encoding(format!(
                "rav1d get_picture failed ({})",
                rc.0
            )));
        }

        let layout = pic.p.layout;
        let subsampling = match layout {
            DAV1D_PIXEL_LAYOUT_I400 => Some((false, false, true)),
            DAV1D_PIXEL_LAYOUT_I420 => Some((true, true, false)),
            DAV1D_PIXEL_LAYOUT_I422 => Some((true, false, false)),
            DAV1D_PIXEL_LAYOUT_I444 => Some((false, false, false)),
            _ => None,
        };
        let planes = subsampling.and_then(|(ss_x, ss_y, monochrome)| {
            let y_ptr = pic.data[0]?.as_ptr() as *const u8;
            let (u_ptr, v_ptr) = if monochrome {
                (y_ptr, y_ptr)
            } else {
                (
                    pic.data[1]?.as_ptr() as *const u8,
                    pic.data[2]?.as_ptr() as *const u8,
                )
            };
            Some(YuvPlanes {
                y_ptr,
                u_ptr,
                v_ptr,
                y_stride: pic.stride[0],
                uv_stride: if monochrome { 0 } else { pic.stride[1] },
                width: pic.p.w as u32,
                height: pic.p.h as u32,
                bpc: pic.p.bpc as u32,
                ss_x,
                ss_y,
                monochrome,
            })
        });
        let result = match planes {
            Some(planes) => Ok(Frame {
                width: planes.width,
                height: planes.height,
                samples: convert(&planes),
            }),
            None => Err(ProcessingError::encoding(format!(
                "unsupported AVIF pixel layout: {layout}"
            ))),
        };
        unsafe { dav1d::dav1d_picture_unref(NonNull::new(&mut pic)) };
        result
    })();

    unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
    decoded
}

/// Decoded YUV plane pointers from rav1d, valid until the picture is unref'd.
struct YuvPlanes {
    y_ptr: *const u8,
    u_ptr: *const u8,
    v_ptr: *const u8,
    y_stride: isize,
    uv_stride: isize,
    width: u32,
    height: u32,
    bpc: u32,
    ss_x: bool,
    ss_y: bool,
    monochrome: bool,
}

impl YuvPlanes {
    /// Interleaved RGB8 using BT.601 coefficients.
    fn to_rgb(&self) -> Vec<u8> {
        let max_val = ((1u32 << self.bpc) - 1) as f32;
        let center = (1u32 << (self.bpc - 1)) as f32;
        let scale = 255.0 / max_val;

        let mut rgb = Vec::with_capacity((self.width * self.height * 3) as usize);
        for row in 0..self.height {
            for col in 0..self.width {
                let y = sample(self.y_ptr, self.y_stride, col, row, self.bpc);
                if self.monochrome {
                    let v = (y * scale).clamp(0.0, 255.0) as u8;
                    rgb.extend_from_slice(&[v, v, v]);
                    continue;
                }
                let cx = if self.ss_x { col / 2 } else { col };
                let cy = if self.ss_y { row / 2 } else { row };
                let cb = sample(self.u_ptr, self.uv_stride, cx, cy, self.bpc) - center;
                let cr = sample(self.v_ptr, self.uv_stride, cx, cy, self.bpc) - center;
                rgb.extend_from_slice(&[
                    ((y + 1.402 * cr) * scale).clamp(0.0, 255.0) as u8,
                    ((y - 0.344136 * cb - 0.714136 * cr) * scale).clamp(0.0, 255.0) as u8,
                    ((y + 1.772 * cb) * scale).clamp(0.0, 255.0) as u8,
                ]);
            }
        }
        rgb
    }

    /// The Y plane alone as 8-bit samples (alpha frames are monochrome).
    fn to_luma(&self) -> Vec<u8> {
        let scale = 255.0 / ((1u32 << self.bpc) - 1) as f32;
        let mut luma = Vec::with_capacity((self.width * self.height) as usize);
        for row in 0..self.height {
            for col in 0..self.width {
                let y = sample(self.y_ptr, self.y_stride, col, row, self.bpc);
                luma.push((y * scale).round().clamp(0.0, 255.0) as u8);
            }
        }
        luma
    }
}

/// One plane sample; 10/12-bit planes are stored as u16.
#[inline]
fn sample(ptr: *const u8, stride: isize, x: u32, y: u32, bpc: u32) -> f32 {
    if bpc <= 8 {
        (unsafe { *ptr.offset(y as isize * stride + x as isize) }) as f32
    } else {
        let byte_offset = y as isize * stride + x as isize * 2;
        (unsafe { *(ptr.offset(byte_offset) as *const u16) }) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{encode_png, gradient_rgb, solid_rgba};

    #[test]
    fn decode_png_keeps_dimensions_and_alpha() {
        let png = encode_png(&solid_rgba(30, 20, [10, 20, 30, 128]));
        let raster = decode(&png).unwrap();
        assert_eq!(raster.dimensions(), Dimensions { width: 30, height: 20 });
        assert!(raster.has_alpha());
        assert_eq!(raster.channels(), 4);
        assert_eq!(raster.color_space(), ColorSpace::Srgb);
    }

    #[test]
    fn decode_gray_png_tags_color_space() {
        let gray = image::GrayImage::from_pixel(4, 4, image::Luma([90]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(gray)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        let raster = decode(&EncodedImage::new(buf, ImageFormat::Png)).unwrap();
        assert_eq!(raster.color_space(), ColorSpace::Gray);
        assert_eq!(raster.channels(), 1);
    }

    #[test]
    fn decode_empty_is_invalid_input() {
        let err = decode(&EncodedImage::new(Vec::new(), ImageFormat::Png)).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
    }

    #[test]
    fn decode_garbage_is_encoding_failure() {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        let err = decode(&EncodedImage::new(bytes, ImageFormat::Png)).unwrap_err();
        assert!(matches!(err, ProcessingError::EncodingFailure(_)));
    }

    #[test]
    fn detect_rejects_unknown_bytes() {
        assert!(EncodedImage::detect(b"not an image".to_vec()).is_err());
    }

    #[test]
    fn checksum_is_content_hash() {
        let a = EncodedImage::new(b"abc".to_vec(), ImageFormat::Png);
        let b = EncodedImage::new(b"abc".to_vec(), ImageFormat::Jpeg);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.checksum.len(), 64);
    }

    #[test]
    fn encode_jpeg_drops_alpha() {
        let raster = RasterImage::new(DynamicImage::ImageRgba8(solid_rgba(
            8,
            8,
            [0, 0, 0, 0],
        )));
        let jpeg = encode(&raster, ImageFormat::Jpeg, Quality::new(90)).unwrap();
        assert_eq!(ImageFormat::detect(&jpeg.bytes), Some(ImageFormat::Jpeg));
        let back = decode(&jpeg).unwrap();
        assert!(!back.has_alpha());
        // Fully transparent black over white comes out white-ish
        let px = back.to_rgba8().get_pixel(4, 4).0;
        assert!(px[0] > 240 && px[1] > 240 && px[2] > 240, "{px:?}");
    }

    #[test]
    fn encode_svg_is_invalid() {
        let raster = RasterImage::new(DynamicImage::ImageRgb8(gradient_rgb(4, 4)));
        let err = encode(&raster, ImageFormat::Svg, Quality::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
        let err = encode_pixels(raster.pixels(), ImageFormat::Svg, Quality::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
    }

    #[test]
    fn flatten_blends_partial_alpha() {
        let rgba = solid_rgba(1, 1, [0, 0, 0, 128]);
        let flat = flatten(&rgba, Rgb::WHITE);
        let [r, g, b] = flat.get_pixel(0, 0).0;
        assert_eq!((r, g, b), (127, 127, 127));
    }

    #[test]
    fn prepare_keeps_alpha_for_capable_targets() {
        let raster = RasterImage::new(DynamicImage::ImageRgba8(solid_rgba(2, 2, [1, 2, 3, 4])));
        assert!(prepare_for(&raster, ImageFormat::Png, Rgb::WHITE).color().has_alpha());
        assert!(!prepare_for(&raster, ImageFormat::Jpeg, Rgb::WHITE).color().has_alpha());
    }

    #[test]
    fn rasterize_svg_at_requested_width() {
        let svg = br##"<svg xmlns="http://www.w3.org/2000/svg" width="20" height="10">
            <rect width="20" height="10" fill="#ff0000"/></svg>"##;
        let raster = rasterize_svg(svg, Some(80), &LimitSettings::default()).unwrap();
        assert_eq!(raster.dimensions(), Dimensions { width: 80, height: 40 });
        let px = raster.to_rgba8().get_pixel(40, 20).0;
        assert_eq!(px, [255, 0, 0, 255]);
    }

    #[test]
    fn rasterize_invalid_svg_is_invalid_input() {
        let err = rasterize_svg(b"<svg", None, &LimitSettings::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)));
    }

    #[test]
    fn tall_svg_at_large_width_is_refused_before_rendering() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1000">
            <rect width="1" height="1000"/></svg>"#;
        let err = rasterize_svg(svg, Some(16_384), &LimitSettings::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)), "{err:?}");
        assert!(err.to_string().contains("16384x16384000"), "{err}");
    }

    #[test]
    fn svg_natural_size_respects_limit() {
        let svg = EncodedImage::new(
            br#"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="100">
                <rect width="200" height="100"/></svg>"#
                .to_vec(),
            ImageFormat::Svg,
        );
        let tight = LimitSettings {
            max_output_pixels: 19_999,
        };
        assert!(matches!(
            decode_within(&svg, &tight),
            Err(ProcessingError::InvalidInput(_))
        ));
        let exact = LimitSettings {
            max_output_pixels: 20_000,
        };
        assert_eq!(
            decode_within(&svg, &exact).unwrap().dimensions(),
            Dimensions { width: 200, height: 100 }
        );
    }

    #[test]
    fn oversized_raster_is_refused_from_header() {
        let png = encode_png(&solid_rgba(30, 20, [1, 2, 3, 255]));
        let limits = LimitSettings {
            max_output_pixels: 599,
        };
        let err = decode_within(&png, &limits).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidInput(_)), "{err:?}");
    }

    #[test]
    fn avif_roundtrip_decodes_dimensions() {
        let raster = RasterImage::new(DynamicImage::ImageRgb8(gradient_rgb(64, 48)));
        let avif = encode(&raster, ImageFormat::Avif, Quality::new(85)).unwrap();
        assert_eq!(ImageFormat::detect(&avif.bytes), Some(ImageFormat::Avif));
        let decoded = decode(&avif).unwrap();
        assert_eq!(decoded.dimensions(), Dimensions { width: 64, height: 48 });
    }

    #[test]
    fn avif_roundtrip_keeps_alpha() {
        let raster = RasterImage::new(DynamicImage::ImageRgba8(solid_rgba(
            16,
            16,
            [200, 10, 10, 60],
        )));
        let avif = encode(&raster, ImageFormat::Avif, Quality::new(90)).unwrap();
        let decoded = decode(&avif).unwrap();
        assert!(decoded.has_alpha());
        let [r, g, b, a] = decoded.to_rgba8().get_pixel(8, 8).0;
        assert!(a.abs_diff(60) <= 3, "alpha {a}");
        assert!(r.abs_diff(200) <= 20 && g < 40 && b < 40, "{:?}", (r, g, b));
    }

    #[test]
    fn opaque_avif_decodes_without_alpha() {
        let raster = RasterImage::new(DynamicImage::ImageRgb8(gradient_rgb(8, 8)));
        let avif = encode(&raster, ImageFormat::Avif, Quality::new(80)).unwrap();
        assert!(!decode(&avif).unwrap().has_alpha());
    }

    #[test]
    fn unpremultiply_restores_straight_color() {
        assert_eq!(unpremultiply(50, 100), 128);
        assert_eq!(unpremultiply(0, 0), 0);
        assert_eq!(unpremultiply(255, 255), 255);
    }

    #[test]
    fn output_format_for_vector_is_png() {
        assert_eq!(output_format_for(ImageFormat::Svg), ImageFormat::Png);
        assert_eq!(output_format_for(ImageFormat::Jpeg), ImageFormat::Jpeg);
    }
}
