//! Shared types used across the engine.
//!
//! Everything here is plain data: serialized into job snapshots and metadata
//! records for external collaborators, and passed between the queue, the
//! cache, and the imaging algorithms.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded image container formats the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Png,
    WebP,
    Avif,
    Svg,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Jpeg,
        ImageFormat::Png,
        ImageFormat::WebP,
        ImageFormat::Avif,
        ImageFormat::Svg,
    ];

    pub fn supports_alpha(self) -> bool {
        !matches!(self, ImageFormat::Jpeg)
    }

    pub fn is_vector(self) -> bool {
        matches!(self, ImageFormat::Svg)
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::WebP => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Svg => "svg",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "webp" => Some(ImageFormat::WebP),
            "avif" => Some(ImageFormat::Avif),
            "svg" => Some(ImageFormat::Svg),
            _ => None,
        }
    }

    /// Sniff the format from leading bytes.
    ///
    /// Raster formats are recognized by their magic numbers; SVG is any UTF-8
    /// document whose head contains an `<svg` element.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            return Some(ImageFormat::Png);
        }
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }
        if bytes.len() >= 12 && &bytes[4..8] == b"ftyp" {
            let brand = &bytes[8..12];
            if brand == b"avif" || brand == b"avis" {
                return Some(ImageFormat::Avif);
            }
        }
        let head = &bytes[..bytes.len().min(1024)];
        let text = String::from_utf8_lossy(head);
        if text.contains("<svg") {
            return Some(ImageFormat::Svg);
        }
        None
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
            ImageFormat::WebP => "WebP",
            ImageFormat::Avif => "AVIF",
            ImageFormat::Svg => "SVG",
        };
        f.write_str(name)
    }
}

/// The closed set of operations a job can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Convert,
    Crop,
    Compress,
    Palette,
    Upscale,
}

impl OperationKind {
    /// Stable discriminant mixed into cache fingerprints. Never reorder.
    pub fn discriminant(self) -> &'static str {
        match self {
            OperationKind::Convert => "convert",
            OperationKind::Crop => "crop",
            OperationKind::Compress => "compress",
            OperationKind::Palette => "palette",
            OperationKind::Upscale => "upscale",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.discriminant())
    }
}

/// Scheduling class. Interactive jobs drain before batch jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Interactive,
    #[default]
    Batch,
}

impl Priority {
    pub(crate) fn lane(self) -> usize {
        match self {
            Priority::Interactive => 0,
            Priority::Batch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn area(self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Pixels trimmed from each side of the source.
///
/// The retained rectangle is `[left, width - right) x [top, height - bottom)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub top: u32,
    pub left: u32,
    pub bottom: u32,
    pub right: u32,
}

impl CropRegion {
    pub fn width_within(&self, width: u32) -> u32 {
        width.saturating_sub(self.left + self.right)
    }

    pub fn height_within(&self, height: u32) -> u32 {
        height.saturating_sub(self.top + self.bottom)
    }

    /// Region lies inside the source and keeps a positive area.
    pub fn is_valid_for(&self, width: u32, height: u32) -> bool {
        u64::from(self.left) + u64::from(self.right) < u64::from(width)
            && u64::from(self.top) + u64::from(self.bottom) < u64::from(height)
    }

    pub fn is_empty(&self) -> bool {
        *self == CropRegion::default()
    }
}

/// One dominant color and the fraction of pixels it represents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub color: [u8; 3],
    pub weight: f64,
}

impl PaletteEntry {
    pub fn hex(&self) -> String {
        format!(
            "#{:02x}{:02x}{:02x}",
            self.color[0], self.color[1], self.color[2]
        )
    }
}

/// Non-fatal conditions attached to a successful result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Warning {
    /// Even minimum quality exceeded the byte ceiling; the minimum-quality
    /// encoding was returned anyway.
    SizeConstraintUnmet { ceiling: u64, achieved: u64 },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::SizeConstraintUnmet { ceiling, achieved } => write!(
                f,
                "size constraint unmet: {achieved} bytes at minimum quality, ceiling {ceiling}"
            ),
        }
    }
}

/// Metadata record produced for every finished operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub kind: OperationKind,
    pub source_checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_checksum: Option<String>,
    pub dimensions_before: Dimensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions_after: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,
    /// Upscale only: produced by fallback interpolation instead of the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub palette: Option<Vec<PaletteEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropRegion>,
    /// Compress only: the quality the tuner settled on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl ResultMetadata {
    pub fn new(kind: OperationKind, source_checksum: &str, before: Dimensions) -> Self {
        Self {
            kind,
            source_checksum: source_checksum.to_string(),
            result_checksum: None,
            dimensions_before: before,
            dimensions_after: None,
            format: None,
            degraded: None,
            palette: None,
            crop: None,
            quality: None,
        }
    }
}
