//! Dominant-color extraction by k-means clustering in RGB space.
//!
//! Centroids are seeded from the `k` most populated buckets of a 5-bit per
//! channel histogram (ties broken by bucket index). When fewer than `k`
//! buckets are occupied, the remaining seeds are the most common exact colors
//! not already used (ties broken by value), so close colors sharing a bucket
//! still get their own centroid. There is no random state and the same
//! pixels always give the same palette. Fully transparent
//! pixels never vote but still count toward the total, so weights over a
//! partly transparent image sum to less than 1.
//!
//! Assignment runs in parallel with rayon. Per-chunk sums are integers and
//! integer addition is associative, so the result does not depend on how
//! rayon splits the work.

use super::codec::RasterImage;
use crate::error::ProcessingError;
use crate::types::PaletteEntry;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest accepted `k`.
pub const MAX_COLORS: u32 = 64;

/// Pixels per rayon work item during assignment.
const CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PaletteSettings {
    pub max_iterations: u32,
    /// Stop once no centroid moves farther than this (RGB units).
    pub convergence: f64,
    /// Iterate on at most this many pixels, taken at a fixed stride.
    pub sample_cap: usize,
}

impl Default for PaletteSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence: 0.5,
            sample_cap: 65_536,
        }
    }
}

/// Per-cluster integer sums.
#[derive(Clone)]
struct Accum {
    count: Vec<u64>,
    sum: Vec<[u64; 3]>,
}

impl Accum {
    fn new(k: usize) -> Self {
        Self {
            count: vec![0; k],
            sum: vec![[0; 3]; k],
        }
    }

    fn add(&mut self, cluster: usize, px: [u8; 3]) {
        self.count[cluster] += 1;
        for c in 0..3 {
            self.sum[cluster][c] += u64::from(px[c]);
        }
    }

    fn merge(mut self, other: Accum) -> Accum {
        for i in 0..self.count.len() {
            self.count[i] += other.count[i];
            for c in 0..3 {
                self.sum[i][c] += other.sum[i][c];
            }
        }
        self
    }

    fn mean(&self, cluster: usize) -> Option<[f64; 3]> {
        let n = self.count[cluster];
        (n > 0).then(|| {
            let s = self.sum[cluster];
            [
                s[0] as f64 / n as f64,
                s[1] as f64 / n as f64,
                s[2] as f64 / n as f64,
            ]
        })
    }
}

fn distance_sq(px: [u8; 3], centroid: &[f64; 3]) -> f64 {
    (0..3)
        .map(|c| {
            let d = f64::from(px[c]) - centroid[c];
            d * d
        })
        .sum()
}

/// Index of the nearest centroid; the lowest index wins ties.
fn nearest(px: [u8; 3], centroids: &[[f64; 3]]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let d = distance_sq(px, c);
        if d < best_d {
            best = i;
            best_d = d;
        }
    }
    best
}

fn assign(pixels: &[[u8; 3]], centroids: &[[f64; 3]]) -> Accum {
    let k = centroids.len();
    pixels
        .par_chunks(CHUNK)
        .map(|chunk| {
            let mut acc = Accum::new(k);
            for &px in chunk {
                acc.add(nearest(px, centroids), px);
            }
            acc
        })
        .reduce(|| Accum::new(k), Accum::merge)
}

fn bucket(px: [u8; 3]) -> u32 {
    (u32::from(px[0] >> 3) << 10) | (u32::from(px[1] >> 3) << 5) | u32::from(px[2] >> 3)
}

/// Seed centroids from the most populated histogram buckets, topped up
/// with exact colors when the buckets run out.
fn seed(samples: &[[u8; 3]], k: usize) -> Vec<[f64; 3]> {
    let mut buckets: HashMap<u32, (u64, [u64; 3])> = HashMap::new();
    for &px in samples {
        let entry = buckets.entry(bucket(px)).or_default();
        entry.0 += 1;
        for c in 0..3 {
            entry.1[c] += u64::from(px[c]);
        }
    }
    let mut ranked: Vec<_> = buckets.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.0.cmp(&b.0)));
    let mut centroids: Vec<[f64; 3]> = ranked
        .into_iter()
        .take(k)
        .map(|(_, (n, s))| {
            let n = n as f64;
            [s[0] as f64 / n, s[1] as f64 / n, s[2] as f64 / n]
        })
        .collect();
    if centroids.len() == k {
        return centroids;
    }

    let mut exact: HashMap<[u8; 3], u64> = HashMap::new();
    for &px in samples {
        *exact.entry(px).or_default() += 1;
    }
    let mut colors: Vec<_> = exact.into_iter().collect();
    colors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    for (color, _) in colors {
        if centroids.len() == k {
            break;
        }
        let candidate = color.map(f64::from);
        if !centroids.contains(&candidate) {
            centroids.push(candidate);
        }
    }
    centroids
}

fn subsample(pixels: &[[u8; 3]], cap: usize) -> Vec<[u8; 3]> {
    if cap == 0 || pixels.len() <= cap {
        return pixels.to_vec();
    }
    let stride = pixels.len().div_ceil(cap);
    pixels.iter().step_by(stride).copied().collect()
}

/// Extract up to `k` dominant colors, most populous first.
pub fn extract(
    raster: &RasterImage,
    k: u32,
    settings: &PaletteSettings,
) -> Result<Vec<PaletteEntry>, ProcessingError> {
    if k == 0 || k > MAX_COLORS {
        return Err(ProcessingError::invalid(format!(
            "palette size must be between 1 and {MAX_COLORS}, got {k}"
        )));
    }
    let rgba = raster.to_rgba8();
    let total = u64::from(rgba.width()) * u64::from(rgba.height());
    let opaque: Vec<[u8; 3]> = rgba
        .pixels()
        .filter(|p| p.0[3] > 0)
        .map(|p| [p.0[0], p.0[1], p.0[2]])
        .collect();
    if opaque.is_empty() || total == 0 {
        return Ok(Vec::new());
    }

    let samples = subsample(&opaque, settings.sample_cap);
    let mut centroids = seed(&samples, k as usize);

    for _ in 0..settings.max_iterations {
        let acc = assign(&samples, &centroids);
        let mut shift: f64 = 0.0;
        for (i, centroid) in centroids.iter_mut().enumerate() {
            if let Some(mean) = acc.mean(i) {
                let moved: f64 = (0..3).map(|c| (mean[c] - centroid[c]).powi(2)).sum();
                shift = shift.max(moved.sqrt());
                *centroid = mean;
            }
        }
        if shift < settings.convergence {
            break;
        }
    }

    // Weights come from every opaque pixel, not just the samples.
    let acc = assign(&opaque, &centroids);
    let mut entries: Vec<(u64, PaletteEntry)> = (0..centroids.len())
        .filter_map(|i| {
            let mean = acc.mean(i)?;
            let count = acc.count[i];
            Some((
                count,
                PaletteEntry {
                    color: mean.map(|v| v.round().clamp(0.0, 255.0) as u8),
                    weight: count as f64 / total as f64,
                },
            ))
        })
        .collect();
    entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.color.cmp(&b.1.color)));
    Ok(entries.into_iter().map(|(_, entry)| entry).collect())
}
