//! Operation registry: the closed set of things a job can ask for.
//!
//! [`Operation`] is validated once at submission, canonicalized for the
//! cache fingerprint, and dispatched by [`Registry::execute`] with an
//! exhaustive `match`. Validation is the only source of `InvalidInput` for
//! parameter problems; adding a variant forces every match here to be
//! updated.
//!
//! ## Canonical parameters
//!
//! Two requests that mean the same thing must fingerprint the same. The
//! canonical form fills defaults (`background` white, convert `quality`
//! from settings, compress `format` from the source), lowercases colors,
//! sorts object keys, and prints whole floats as integers.

use crate::cache::Weighted;
use crate::error::ProcessingError;
use crate::imaging::codec::{EncodedImage, LimitSettings, decode_within, encode, output_format_for};
use crate::imaging::compress::{self, CompressSettings};
use crate::imaging::convert::{self, ConvertOptions};
use crate::imaging::crop::{self, CropSettings};
use crate::imaging::palette::{self, MAX_COLORS, PaletteSettings};
use crate::imaging::{Constraint, Quality, Rgb};
use crate::types::{ImageFormat, OperationKind, ResultMetadata, Warning};
use crate::upscale::{SUPPORTED_FACTORS, Upscaler};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Largest pixel width an SVG may be rasterized to.
pub const MAX_RASTER_WIDTH: u32 = 16_384;

/// Fixed overhead charged per cached result on top of its bytes.
const ENTRY_OVERHEAD: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Operation {
    Convert {
        target: ImageFormat,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raster_width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<Rgb>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quality: Option<u32>,
    },
    Crop,
    Compress {
        /// Output format; the source's own format when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<ImageFormat>,
        constraint: Constraint,
    },
    Palette {
        k: u32,
    },
    Upscale {
        scale_factor: u32,
    },
}

fn check_quality(q: u32) -> Result<(), ProcessingError> {
    if (1..=100).contains(&q) {
        Ok(())
    } else {
        Err(ProcessingError::invalid(format!(
            "quality must be between 1 and 100, got {q}"
        )))
    }
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Convert { .. } => OperationKind::Convert,
            Operation::Crop => OperationKind::Crop,
            Operation::Compress { .. } => OperationKind::Compress,
            Operation::Palette { .. } => OperationKind::Palette,
            Operation::Upscale { .. } => OperationKind::Upscale,
        }
    }

    /// Reject parameters no execution could satisfy.
    ///
    /// A convert to SVG passes: whether it is supported is a property of the
    /// conversion, reported as `UnsupportedConversion` when the job runs.
    pub fn validate(&self) -> Result<(), ProcessingError> {
        match self {
            Operation::Convert {
                raster_width,
                quality,
                ..
            } => {
                if let Some(w) = raster_width
                    && !(1..=MAX_RASTER_WIDTH).contains(w)
                {
                    return Err(ProcessingError::invalid(format!(
                        "raster width must be between 1 and {MAX_RASTER_WIDTH}, got {w}"
                    )));
                }
                if let Some(q) = quality {
                    check_quality(*q)?;
                }
                Ok(())
            }
            Operation::Crop => Ok(()),
            Operation::Compress { format, constraint } => {
                if format.is_some_and(ImageFormat::is_vector) {
                    return Err(ProcessingError::invalid("cannot compress to a vector format"));
                }
                match constraint {
                    Constraint::Quality(q) => check_quality(*q),
                    Constraint::MaxBytes(0) => {
                        Err(ProcessingError::invalid("byte ceiling must be positive"))
                    }
                    Constraint::MaxBytes(_) => Ok(()),
                }
            }
            Operation::Palette { k } => {
                if (1..=MAX_COLORS).contains(k) {
                    Ok(())
                } else {
                    Err(ProcessingError::invalid(format!(
                        "palette size must be between 1 and {MAX_COLORS}, got {k}"
                    )))
                }
            }
            Operation::Upscale { scale_factor } => {
                if SUPPORTED_FACTORS.contains(scale_factor) {
                    Ok(())
                } else {
                    Err(ProcessingError::invalid(format!(
                        "scale factor must be 2 or 4, got {scale_factor}"
                    )))
                }
            }
        }
    }

    /// Same operation with every defaulted parameter made explicit.
    fn resolved(&self, defaults: &CompressSettings, source: ImageFormat) -> Operation {
        match self {
            Operation::Convert {
                target,
                raster_width,
                background,
                quality,
            } => Operation::Convert {
                target: *target,
                raster_width: *raster_width,
                background: Some(background.unwrap_or_default()),
                quality: Some(quality.unwrap_or(defaults.default_quality)),
            },
            Operation::Compress { format, constraint } => Operation::Compress {
                format: Some(format.unwrap_or_else(|| output_format_for(source))),
                constraint: *constraint,
            },
            other => other.clone(),
        }
    }

    /// Deterministic parameter string for fingerprinting a run against a
    /// source of format `source`.
    pub fn canonical_params(&self, defaults: &CompressSettings, source: ImageFormat) -> String {
        let value = serde_json::to_value(self.resolved(defaults, source)).unwrap_or(Value::Null);
        let mut out = String::new();
        write_canonical(&value, &mut out);
        out
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out);
            }
            out.push(']');
        }
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string());
            }
            _ => out.push_str(&n.to_string()),
        },
        other => out.push_str(&other.to_string()),
    }
}

/// What an operation produced: an image (none for palette), the metadata
/// record, and any non-fatal warnings.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    pub image: Option<EncodedImage>,
    pub metadata: ResultMetadata,
    pub warnings: Vec<Warning>,
}

impl Weighted for OperationOutput {
    fn weight(&self) -> usize {
        self.image.as_ref().map_or(0, EncodedImage::len) + ENTRY_OVERHEAD
    }
}

/// Dispatches operations to the imaging algorithms and the upscaler.
pub struct Registry {
    crop: CropSettings,
    compress: CompressSettings,
    palette: PaletteSettings,
    limits: LimitSettings,
    upscaler: Upscaler,
}

impl Registry {
    pub fn new(
        crop: CropSettings,
        compress: CompressSettings,
        palette: PaletteSettings,
        limits: LimitSettings,
        upscaler: Upscaler,
    ) -> Self {
        Self {
            crop,
            compress,
            palette,
            limits,
            upscaler,
        }
    }

    pub fn compress_settings(&self) -> &CompressSettings {
        &self.compress
    }

    fn default_quality(&self) -> Quality {
        Quality::new(self.compress.default_quality)
    }

    pub fn execute(
        &self,
        op: &Operation,
        source: &EncodedImage,
    ) -> Result<OperationOutput, ProcessingError> {
        op.validate()?;
        let kind = op.kind();
        match op {
            Operation::Convert {
                target,
                raster_width,
                background,
                quality,
            } => {
                let options = ConvertOptions {
                    raster_width: *raster_width,
                    background: background.unwrap_or_default(),
                    quality: quality.map_or(self.default_quality(), Quality::new),
                    limits: self.limits,
                };
                let out = convert::convert(source, *target, &options)?;
                let mut metadata = ResultMetadata::new(kind, &source.checksum, out.before);
                metadata.dimensions_after = Some(out.after);
                metadata.format = Some(out.image.format);
                Ok(OperationOutput {
                    image: Some(out.image),
                    metadata,
                    warnings: Vec::new(),
                })
            }
            Operation::Crop => {
                let raster = decode_within(source, &self.limits)?;
                let region = crop::detect(&raster, &self.crop);
                let cropped = crop::apply(&raster, &region)?;
                let format = output_format_for(source.format);
                let image = encode(&cropped, format, self.default_quality())?;
                let mut metadata = ResultMetadata::new(kind, &source.checksum, raster.dimensions());
                metadata.dimensions_after = Some(cropped.dimensions());
                metadata.format = Some(format);
                metadata.crop = Some(region);
                Ok(OperationOutput {
                    image: Some(image),
                    metadata,
                    warnings: Vec::new(),
                })
            }
            Operation::Compress { format, constraint } => {
                let raster = decode_within(source, &self.limits)?;
                let format = format.unwrap_or_else(|| output_format_for(source.format));
                let out = compress::compress(&raster, format, *constraint, &self.compress)?;
                let mut metadata = ResultMetadata::new(kind, &source.checksum, raster.dimensions());
                metadata.dimensions_after = Some(raster.dimensions());
                metadata.format = Some(format);
                metadata.quality = Some(out.quality.value());
                Ok(OperationOutput {
                    image: Some(out.image),
                    metadata,
                    warnings: out.warning.into_iter().collect(),
                })
            }
            Operation::Palette { k } => {
                let raster = decode_within(source, &self.limits)?;
                let entries = palette::extract(&raster, *k, &self.palette)?;
                let mut metadata = ResultMetadata::new(kind, &source.checksum, raster.dimensions());
                metadata.palette = Some(entries);
                Ok(OperationOutput {
                    image: None,
                    metadata,
                    warnings: Vec::new(),
                })
            }
            Operation::Upscale { scale_factor } => {
                let out = self.upscaler.upscale(source, *scale_factor)?;
                let mut metadata = ResultMetadata::new(kind, &source.checksum, out.before);
                metadata.dimensions_after = Some(out.after);
                metadata.format = Some(out.image.format);
                metadata.degraded = Some(out.degraded);
                Ok(OperationOutput {
                    image: Some(out.image),
                    metadata,
                    warnings: Vec::new(),
                })
            }
        }
    }
}
