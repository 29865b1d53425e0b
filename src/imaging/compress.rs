//! Compression tuner: encode to a quality level or under a byte ceiling.
//!
//! A fixed quality is a single encode. A byte ceiling first probes minimum
//! quality; if that already overflows, the minimum-quality encoding is
//! returned with [`Warning::SizeConstraintUnmet`]. Otherwise the integer
//! quality interval `[2, 100]` is bisected, keeping the highest quality that
//! fit, until the interval collapses or `max_search_steps` encodes (probe
//! included) have been spent.
//!
//! PNG and WebP are lossless, so quality there only moves PNG's compression
//! level; the same search still applies and simply settles quickly.

use super::codec::{EncodedImage, RasterImage, encode_pixels, prepare_for};
use super::params::{Constraint, Quality, Rgb};
use crate::error::ProcessingError;
use crate::types::{ImageFormat, Warning};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressSettings {
    /// Upper bound on encodes for a byte-ceiling search, including the probe.
    pub max_search_steps: u32,
    /// Quality used by operations that re-encode without an explicit target.
    pub default_quality: u32,
}

impl Default for CompressSettings {
    fn default() -> Self {
        Self {
            max_search_steps: 8,
            default_quality: 90,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressOutput {
    pub image: EncodedImage,
    pub quality: Quality,
    /// Number of encodes performed.
    pub steps: u32,
    pub warning: Option<Warning>,
}

/// Compress `raster` into `format` under `constraint`.
pub fn compress(
    raster: &RasterImage,
    format: ImageFormat,
    constraint: Constraint,
    settings: &CompressSettings,
) -> Result<CompressOutput, ProcessingError> {
    if format.is_vector() {
        return Err(ProcessingError::invalid("cannot compress to a vector format"));
    }
    let pixels = prepare_for(raster, format, Rgb::WHITE);

    match constraint {
        Constraint::Quality(q) => {
            let quality = Quality::new(q);
            let image = encode_pixels(&pixels, format, quality)?;
            Ok(CompressOutput {
                image,
                quality,
                steps: 1,
                warning: None,
            })
        }
        Constraint::MaxBytes(ceiling) => {
            let fits = |image: &EncodedImage| image.len() as u64 <= ceiling;

            let floor = encode_pixels(&pixels, format, Quality::MIN)?;
            let mut steps = 1;
            if !fits(&floor) {
                let achieved = floor.len() as u64;
                debug!(%format, ceiling, achieved, "minimum quality exceeds byte ceiling");
                return Ok(CompressOutput {
                    image: floor,
                    quality: Quality::MIN,
                    steps,
                    warning: Some(Warning::SizeConstraintUnmet { ceiling, achieved }),
                });
            }

            let mut best = (Quality::MIN, floor);
            let mut lo = u32::from(Quality::MIN.value()) + 1;
            let mut hi = u32::from(Quality::MAX.value());
            while lo <= hi && steps < settings.max_search_steps {
                let mid = lo + (hi - lo) / 2;
                let candidate = encode_pixels(&pixels, format, Quality::new(mid))?;
                steps += 1;
                if fits(&candidate) {
                    best = (Quality::new(mid), candidate);
                    lo = mid + 1;
                } else {
                    hi = mid - 1;
                }
            }

            let (quality, image) = best;
            debug!(%format, ceiling, quality = quality.value(), steps, size = image.len(), "size search finished");
            Ok(CompressOutput {
                image,
                quality,
                steps,
                warning: None,
            })
        }
    }
}
