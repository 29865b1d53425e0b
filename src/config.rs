//! Engine configuration.
//!
//! Handles loading, validating, and merging `imagemill.toml`. Stock defaults
//! are the base layer; a user file overrides any subset of keys.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [workers]
//! # count = 8                      # Worker threads (omit for auto = CPU cores)
//! max_in_flight_per_submitter = 4  # Running jobs per submitter
//! max_queue_depth = 1024           # Queued jobs before submissions are refused
//!
//! [cache]
//! capacity_bytes = 268435456       # Result cache budget (256 MiB)
//!
//! [retry]
//! max_attempts = 3                 # Attempts for transient upscaler failures
//! base_backoff_ms = 200            # Doubles on every retry
//!
//! [upscaler]
//! # endpoint = "http://localhost:8500/upscale"
//! timeout_ms = 10000
//! fallback = true                  # Interpolate when the service is down
//!
//! [crop]
//! max_side_fraction = 0.15
//! min_area_fraction = 0.6
//! uniformity_ratio = 0.05
//! threshold_floor = 1.0
//!
//! [palette]
//! max_iterations = 20
//! convergence = 0.5
//! sample_cap = 65536
//!
//! [compress]
//! max_search_steps = 8
//! default_quality = 90
//!
//! [limits]
//! max_output_pixels = 100000000    # Largest raster decoded or produced
//! ```
//!
//! ## Partial Configuration
//!
//! Config files are sparse, override just the values you want:
//!
//! ```toml
//! [upscaler]
//! endpoint = "http://gpu-box:8500/upscale"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::{CompressSettings, CropSettings, LimitSettings, PaletteSettings};
use crate::upscale::UpscalerSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Engine configuration loaded from `imagemill.toml`.
///
/// All fields have sensible defaults. User config files need only specify
/// the values they want to override. Unknown keys are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker pool and queue limits.
    pub workers: WorkersConfig,
    /// Result cache budget.
    pub cache: CacheConfig,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// External inference service.
    pub upscaler: UpscalerSettings,
    pub crop: CropSettings,
    pub palette: PaletteSettings,
    pub compress: CompressSettings,
    /// Size bounds on rasters.
    pub limits: LimitSettings,
}

impl EngineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.into()));

        if self.workers.count == Some(0) {
            return fail("workers.count must be at least 1");
        }
        if self.workers.max_in_flight_per_submitter == 0 {
            return fail("workers.max_in_flight_per_submitter must be at least 1");
        }
        if self.workers.max_queue_depth == 0 {
            return fail("workers.max_queue_depth must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.upscaler.timeout_ms == 0 {
            return fail("upscaler.timeout_ms must be positive");
        }
        if !(0.0..0.5).contains(&self.crop.max_side_fraction) {
            return fail("crop.max_side_fraction must be in [0, 0.5)");
        }
        if !(self.crop.min_area_fraction > 0.0 && self.crop.min_area_fraction <= 1.0) {
            return fail("crop.min_area_fraction must be in (0, 1]");
        }
        if self.crop.uniformity_ratio < 0.0 || self.crop.threshold_floor < 0.0 {
            return fail("crop thresholds must not be negative");
        }
        if self.palette.max_iterations == 0 {
            return fail("palette.max_iterations must be at least 1");
        }
        if self.palette.convergence < 0.0 {
            return fail("palette.convergence must not be negative");
        }
        if self.compress.max_search_steps == 0 {
            return fail("compress.max_search_steps must be at least 1");
        }
        if !(1..=100).contains(&self.compress.default_quality) {
            return fail("compress.default_quality must be 1-100");
        }
        if self.limits.max_output_pixels == 0 {
            return fail("limits.max_output_pixels must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub count: Option<usize>,
    pub max_in_flight_per_submitter: usize,
    pub max_queue_depth: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: None,
            max_in_flight_per_submitter: 4,
            max_queue_depth: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub capacity_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each time.
    pub base_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
        }
    }
}

/// Resolve the effective worker count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_workers(config: &WorkersConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.count.map(|n| n.min(cores)).unwrap_or(cores)
}

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(EngineConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Merge an optional overlay onto the stock defaults, then deserialize and
/// validate.
pub fn resolve_config(overlay: Option<toml::Value>) -> Result<EngineConfig, ConfigError> {
    let base = stock_defaults_value()?;
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: EngineConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load config from a TOML file, or stock defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let overlay = match path {
        Some(p) => Some(toml::from_str::<toml::Value>(&fs::read_to_string(p)?)?),
        None => None,
    };
    resolve_config(overlay)
}

/// Returns a fully-commented stock `imagemill.toml` with all keys.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# imagemill configuration
# ========================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Worker pool
# ---------------------------------------------------------------------------
[workers]
# Number of worker threads. Omit to use all CPU cores.
# Values larger than the core count are clamped down.
# count = 4

# Jobs one submitter may have running at once. Extra jobs wait in the queue.
max_in_flight_per_submitter = 4

# Jobs waiting in the queue before new submissions are refused as overloaded.
max_queue_depth = 1024

# ---------------------------------------------------------------------------
# Result cache
# ---------------------------------------------------------------------------
[cache]
# Total bytes of cached results. Least recently used entries are evicted.
capacity_bytes = 268435456

# ---------------------------------------------------------------------------
# Retries (upscaler outages only)
# ---------------------------------------------------------------------------
[retry]
# Attempts per job, including the first.
max_attempts = 3

# Delay before the first retry in milliseconds; doubles on each retry.
base_backoff_ms = 200

# ---------------------------------------------------------------------------
# Upscaler inference service
# ---------------------------------------------------------------------------
[upscaler]
# POST {endpoint}?scale=N with the image as the body.
# Without an endpoint every upscale is interpolated and marked degraded.
# endpoint = "http://localhost:8500/upscale"

# How long to wait for the service before giving up.
timeout_ms = 10000

# Interpolate (bicubic) when the service fails. When false, failures are
# retried and then reported as upscale_service_unavailable.
fallback = true

# ---------------------------------------------------------------------------
# Smart crop
# ---------------------------------------------------------------------------
[crop]
# Largest fraction of width/height a single side may lose.
max_side_fraction = 0.15

# Smallest fraction of the original area the crop must keep.
min_area_fraction = 0.6

# A line is uniform while its variance stays below this fraction of the
# whole image's variance...
uniformity_ratio = 0.05

# ...or below this absolute floor, whichever is larger.
threshold_floor = 1.0

# ---------------------------------------------------------------------------
# Palette extraction (k-means)
# ---------------------------------------------------------------------------
[palette]
max_iterations = 20

# Stop once no centroid moves farther than this many RGB units.
convergence = 0.5

# Cluster on at most this many pixels, sampled at a fixed stride.
sample_cap = 65536

# ---------------------------------------------------------------------------
# Compression
# ---------------------------------------------------------------------------
[compress]
# Encodes allowed when searching for a byte ceiling.
max_search_steps = 8

# Quality for operations that re-encode without an explicit target.
default_quality = 90

# ---------------------------------------------------------------------------
# Limits
# ---------------------------------------------------------------------------
[limits]
# Largest raster, in pixels, that decoding, SVG rasterizing or upscaling may
# produce. Larger requests fail as invalid input before any pixels are
# allocated.
max_output_pixels = 100000000
"##
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn default_config_passes_validation() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[workers]
max_queue_depth = 10

[upscaler]
endpoint = "http://localhost:9000/up"
"#;
        let config: EngineConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.workers.max_queue_depth, 10);
        assert_eq!(config.workers.max_in_flight_per_submitter, 4);
        assert_eq!(
            config.upscaler.endpoint.as_deref(),
            Some("http://localhost:9000/up")
        );
        assert!(config.upscaler.fallback);
    }

    // =========================================================================
    // effective_workers
    // =========================================================================

    #[test]
    fn effective_workers_auto() {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_workers(&WorkersConfig::default()), cores);
    }

    #[test]
    fn effective_workers_clamped_to_cores() {
        let config = WorkersConfig {
            count: Some(99999),
            ..WorkersConfig::default()
        };
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        assert_eq!(effective_workers(&config), cores);
    }

    #[test]
    fn effective_workers_user_constrains_down() {
        let config = WorkersConfig {
            count: Some(1),
            ..WorkersConfig::default()
        };
        assert_eq!(effective_workers(&config), 1);
    }

    // =========================================================================
    // merge_toml
    // =========================================================================

    #[test]
    fn merge_toml_table_merge() {
        let base: toml::Value = toml::from_str(
            r#"
[retry]
max_attempts = 3
base_backoff_ms = 200
"#,
        )
        .unwrap();
        let overlay: toml::Value = toml::from_str(
            r#"
[retry]
max_attempts = 5
"#,
        )
        .unwrap();
        let merged = merge_toml(base, overlay);
        let retry = merged.get("retry").unwrap();
        assert_eq!(retry.get("max_attempts").unwrap().as_integer(), Some(5));
        assert_eq!(retry.get("base_backoff_ms").unwrap().as_integer(), Some(200));
    }

    #[test]
    fn merge_toml_scalar_override() {
        let base: toml::Value = toml::from_str("a = 1\nb = 2").unwrap();
        let overlay: toml::Value = toml::from_str("a = 10").unwrap();
        let merged = merge_toml(base, overlay);
        assert_eq!(merged.get("a").unwrap().as_integer(), Some(10));
        assert_eq!(merged.get("b").unwrap().as_integer(), Some(2));
    }

    // =========================================================================
    // Loading
    // =========================================================================

    #[test]
    fn load_config_without_file_is_default() {
        assert_eq!(load_config(None).unwrap(), EngineConfig::default());
    }

    #[test]
    fn load_config_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("imagemill.toml");
        fs::write(
            &path,
            r#"
[crop]
max_side_fraction = 0.2

[palette]
sample_cap = 1000
"#,
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.crop.max_side_fraction, 0.2);
        assert_eq!(config.crop.min_area_fraction, 0.6);
        assert_eq!(config.palette.sample_cap, 1000);
    }

    #[test]
    fn load_config_invalid_toml_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("imagemill.toml");
        fs::write(&path, "this is not valid toml [[[").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn load_config_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let result = load_config(Some(&tmp.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn load_config_validates_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("imagemill.toml");
        fs::write(&path, "[compress]\ndefault_quality = 200\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn unknown_key_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("[cache]\ncapacity = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn unknown_section_rejected() {
        let result: Result<EngineConfig, _> = toml::from_str("[gpu]\nenabled = true\n");
        assert!(result.is_err());
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn validate_rejects_zero_limits() {
        let mut config = EngineConfig::default();
        config.workers.max_in_flight_per_submitter = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.workers.count = Some(0);
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.limits.max_output_pixels = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_pixel_limit() {
        let config: EngineConfig = toml::from_str("[limits]\nmax_output_pixels = 4096\n").unwrap();
        assert_eq!(config.limits.max_output_pixels, 4096);
        assert_eq!(config.compress, CompressSettings::default());
    }

    #[test]
    fn validate_rejects_crop_fractions_out_of_range() {
        let mut config = EngineConfig::default();
        config.crop.max_side_fraction = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.crop.min_area_fraction = 0.0;
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Stock config
    // =========================================================================

    #[test]
    fn stock_config_toml_roundtrips_to_defaults() {
        let config: EngineConfig = toml::from_str(stock_config_toml()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
