//! Pure calculation functions for image geometry.
//!
//! All functions here are pure and testable without any I/O or images.

use crate::types::CropRegion;

/// Maximum number of pixels a single side may lose to smart crop.
///
/// # Arguments
/// * `extent` - Length of the axis the side lies on (height for top/bottom)
/// * `max_fraction` - Upper bound as a fraction of `extent`
///
/// # Examples
/// ```
/// # use imagemill::imaging::calculations::max_side_crop;
/// assert_eq!(max_side_crop(100, 0.15), 15);
/// assert_eq!(max_side_crop(10, 0.15), 1);
/// ```
pub fn max_side_crop(extent: u32, max_fraction: f64) -> u32 {
    let limit = (f64::from(extent) * max_fraction).floor() as u32;
    // Opposite sides together must leave at least one line.
    limit.min(extent.saturating_sub(1) / 2)
}

/// Whether a crop keeps at least `min_fraction` of the source area.
pub fn retains_area(region: &CropRegion, width: u32, height: u32, min_fraction: f64) -> bool {
    let kept = u64::from(region.width_within(width)) * u64::from(region.height_within(height));
    let total = u64::from(width) * u64::from(height);
    // Tolerance absorbs fractions like 0.7 that have no exact binary form.
    total > 0 && kept as f64 >= total as f64 * min_fraction - 1e-6
}

/// Shrink a crop until it keeps at least `min_fraction` of the area.
///
/// Gives back one pixel at a time from whichever side currently crops the
/// most, so unequal borders converge toward a symmetric reduction. Ties are
/// resolved top, bottom, left, right. The result is the least reduction that
/// satisfies the area bound.
pub fn shrink_to_min_area(
    region: CropRegion,
    width: u32,
    height: u32,
    min_fraction: f64,
) -> CropRegion {
    let mut region = region;
    while !region.is_empty() && !retains_area(&region, width, height, min_fraction) {
        let largest = region
            .top
            .max(region.bottom)
            .max(region.left)
            .max(region.right);
        if region.top == largest {
            region.top -= 1;
        } else if region.bottom == largest {
            region.bottom -= 1;
        } else if region.left == largest {
            region.left -= 1;
        } else {
            region.right -= 1;
        }
    }
    region
}

/// Calculate output dimensions for an integer upscale.
///
/// Returns `None` if the result would overflow `u32`.
pub fn scaled_dimensions(dims: (u32, u32), factor: u32) -> Option<(u32, u32)> {
    Some((dims.0.checked_mul(factor)?, dims.1.checked_mul(factor)?))
}

/// Whether a `width` x `height` raster stays within `max_pixels`.
///
/// # Examples
/// ```
/// # use imagemill::imaging::calculations::fits_pixel_budget;
/// assert!(fits_pixel_budget(100, 100, 10_000));
/// assert!(!fits_pixel_budget(16_384, 16_384_000, 100_000_000));
/// ```
pub fn fits_pixel_budget(width: u32, height: u32, max_pixels: u64) -> bool {
    u64::from(width) * u64::from(height) <= max_pixels
}

/// Calculate raster dimensions for an SVG of natural size `natural` rendered
/// at `target_width` pixels wide, preserving aspect ratio.
///
/// # Returns
/// * `(width, height, scale)` - pixel size and the scale factor to render at
pub fn raster_dimensions(natural: (f32, f32), target_width: Option<u32>) -> (u32, u32, f32) {
    let (nat_w, nat_h) = natural;
    let scale = match target_width {
        Some(w) if nat_w > 0.0 => w as f32 / nat_w,
        _ => 1.0,
    };
    let width = (nat_w * scale).round().max(1.0) as u32;
    let height = (nat_h * scale).round().max(1.0) as u32;
    (width, height, scale)
}

/// Exponential backoff delay before retry `attempt` (1-based).
///
/// # Examples
/// ```
/// # use imagemill::imaging::calculations::backoff_delay_ms;
/// assert_eq!(backoff_delay_ms(100, 1), 100);
/// assert_eq!(backoff_delay_ms(100, 3), 400);
/// ```
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << exponent)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Crop bounds
    // =========================================================================

    #[test]
    fn side_crop_limit_is_fraction_of_extent() {
        assert_eq!(max_side_crop(200, 0.15), 30);
        assert_eq!(max_side_crop(100, 0.0), 0);
    }

    #[test]
    fn side_crop_limit_never_consumes_whole_axis() {
        assert_eq!(max_side_crop(2, 0.9), 0);
        assert_eq!(max_side_crop(3, 0.9), 1);
        assert_eq!(max_side_crop(0, 0.5), 0);
    }

    #[test]
    fn retains_area_boundary() {
        let region = CropRegion {
            top: 10,
            left: 10,
            bottom: 10,
            right: 10,
        };
        // 80x80 of 100x100 = 64%
        assert!(retains_area(&region, 100, 100, 0.64));
        assert!(!retains_area(&region, 100, 100, 0.65));
    }

    #[test]
    fn shrink_leaves_satisfying_region_untouched() {
        let region = CropRegion {
            top: 5,
            left: 5,
            bottom: 5,
            right: 5,
        };
        assert_eq!(shrink_to_min_area(region, 100, 100, 0.6), region);
    }

    #[test]
    fn shrink_reduces_symmetrically() {
        // 15% per side keeps 49%; needs to give back until >= 60%
        let region = CropRegion {
            top: 15,
            left: 15,
            bottom: 15,
            right: 15,
        };
        let shrunk = shrink_to_min_area(region, 100, 100, 0.6);
        assert!(retains_area(&shrunk, 100, 100, 0.6));
        let sides = [shrunk.top, shrunk.bottom, shrunk.left, shrunk.right];
        let max = *sides.iter().max().unwrap();
        let min = *sides.iter().min().unwrap();
        assert!(max - min <= 1, "sides should stay balanced: {sides:?}");
        // One pixel less reduction would violate the bound
        assert!(shrunk.top >= 9);
    }

    #[test]
    fn shrink_prefers_largest_side_first() {
        let region = CropRegion {
            top: 40,
            left: 0,
            bottom: 0,
            right: 0,
        };
        let shrunk = shrink_to_min_area(region, 100, 100, 0.7);
        assert_eq!(shrunk.top, 30);
        assert_eq!(shrunk.bottom, 0);
    }

    // =========================================================================
    // Scaling
    // =========================================================================

    #[test]
    fn scaled_dimensions_multiplies() {
        assert_eq!(scaled_dimensions((10, 20), 4), Some((40, 80)));
        assert_eq!(scaled_dimensions((u32::MAX, 1), 2), None);
    }

    #[test]
    fn pixel_budget_is_inclusive_and_overflow_free() {
        assert!(fits_pixel_budget(200, 100, 20_000));
        assert!(!fits_pixel_budget(200, 101, 20_000));
        assert!(!fits_pixel_budget(u32::MAX, u32::MAX, u64::MAX - 1));
    }

    #[test]
    fn raster_dimensions_natural_size() {
        assert_eq!(raster_dimensions((100.0, 50.0), None), (100, 50, 1.0));
    }

    #[test]
    fn raster_dimensions_preserve_aspect() {
        let (w, h, scale) = raster_dimensions((100.0, 50.0), Some(400));
        assert_eq!((w, h), (400, 200));
        assert_eq!(scale, 4.0);
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay_ms(50, 1), 50);
        assert_eq!(backoff_delay_ms(50, 2), 100);
        assert_eq!(backoff_delay_ms(50, 4), 400);
        assert_eq!(backoff_delay_ms(u64::MAX, 3), u64::MAX);
    }
}
