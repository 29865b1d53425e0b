//! Smart crop: trim uniform borders from each side.
//!
//! Each border is scanned inward one line (row or column) at a time. A line
//! is *uniform* when its color variance stays under a threshold derived from
//! the whole image's variance, so a noisy photo tolerates more variation in
//! its border than a flat illustration does. Sides advance independently
//! and stop at the first non-uniform line or at `max_side_fraction`.
//!
//! If the four independent crops together keep less than
//! `min_area_fraction` of the image, they are shrunk back with
//! [`shrink_to_min_area`]. Only integer pixel statistics feed the decision,
//! so identical pixels always produce the identical region.
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---|---|
//! | `max_side_fraction` | 0.15 |
//! | `min_area_fraction` | 0.60 |
//! | `uniformity_ratio` | 0.05 × global variance |
//! | `threshold_floor` | 1.0 |

use super::calculations::{max_side_crop, shrink_to_min_area};
use super::codec::RasterImage;
use crate::error::ProcessingError;
use crate::types::CropRegion;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Tunables for border detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CropSettings {
    /// Largest fraction of the width/height any single side may lose.
    pub max_side_fraction: f64,
    /// Smallest fraction of the original area the crop must keep.
    pub min_area_fraction: f64,
    /// Line variance must stay under this fraction of the global variance.
    pub uniformity_ratio: f64,
    /// Absolute lower bound on the threshold, for near-flat images.
    pub threshold_floor: f64,
}

impl Default for CropSettings {
    fn default() -> Self {
        Self {
            max_side_fraction: 0.15,
            min_area_fraction: 0.60,
            uniformity_ratio: 0.05,
            threshold_floor: 1.0,
        }
    }
}

/// Running per-channel sums over RGBA pixels.
#[derive(Default)]
struct ChannelStats {
    count: u64,
    sum: [u64; 4],
    sum_sq: [u64; 4],
}

impl ChannelStats {
    fn add(&mut self, px: [u8; 4]) {
        self.count += 1;
        for (c, v) in px.iter().enumerate() {
            let v = u64::from(*v);
            self.sum[c] += v;
            self.sum_sq[c] += v * v;
        }
    }

    /// Sum of the four channel variances.
    fn variance(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let n = self.count as f64;
        (0..4)
            .map(|c| {
                let mean = self.sum[c] as f64 / n;
                (self.sum_sq[c] as f64 / n - mean * mean).max(0.0)
            })
            .sum()
    }
}

fn row_variance(img: &RgbaImage, y: u32) -> f64 {
    let mut stats = ChannelStats::default();
    for x in 0..img.width() {
        stats.add(img.get_pixel(x, y).0);
    }
    stats.variance()
}

fn column_variance(img: &RgbaImage, x: u32) -> f64 {
    let mut stats = ChannelStats::default();
    for y in 0..img.height() {
        stats.add(img.get_pixel(x, y).0);
    }
    stats.variance()
}

/// Count uniform lines from an edge, stopping at the first busy one or at `limit`.
fn advance(limit: u32, is_uniform: impl Fn(u32) -> bool) -> u32 {
    (0..limit).take_while(|&i| is_uniform(i)).count() as u32
}

/// Find the crop region for a raster.
pub fn detect(raster: &RasterImage, settings: &CropSettings) -> CropRegion {
    let img = raster.to_rgba8();
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return CropRegion::default();
    }

    let mut global = ChannelStats::default();
    for px in img.pixels() {
        global.add(px.0);
    }
    let threshold = (global.variance() * settings.uniformity_ratio).max(settings.threshold_floor);

    let max_rows = max_side_crop(height, settings.max_side_fraction);
    let max_cols = max_side_crop(width, settings.max_side_fraction);

    let region = CropRegion {
        top: advance(max_rows, |i| row_variance(&img, i) < threshold),
        bottom: advance(max_rows, |i| row_variance(&img, height - 1 - i) < threshold),
        left: advance(max_cols, |i| column_variance(&img, i) < threshold),
        right: advance(max_cols, |i| column_variance(&img, width - 1 - i) < threshold),
    };

    shrink_to_min_area(region, width, height, settings.min_area_fraction)
}

/// Cut `region` out of `raster`, producing a new raster.
pub fn apply(raster: &RasterImage, region: &CropRegion) -> Result<RasterImage, ProcessingError> {
    let (width, height) = (raster.width(), raster.height());
    if !region.is_valid_for(width, height) {
        return Err(ProcessingError::invalid(format!(
            "crop region {region:?} does not fit {width}x{height}"
        )));
    }
    let cropped = raster.pixels().crop_imm(
        region.left,
        region.top,
        region.width_within(width),
        region.height_within(height),
    );
    Ok(RasterImage::new(cropped))
}
