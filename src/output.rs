//! CLI output formatting for job reports.
//!
//! # Report Layout
//!
//! A report leads with the job's identity and outcome, then lists what the
//! operation produced as indented context lines:
//!
//! ```text
//! job-1 compress: succeeded (1 attempt)
//!     Source: 3b7c9e…
//!     Result: 91d0aa…
//!     Size: 640x480 → 640x480
//!     Format: JPEG
//!     Quality: 62
//!     Warning: size constraint unmet: 5120 bytes at minimum quality, ceiling 4096
//! ```
//!
//! Palette jobs list one swatch per line instead of a result checksum:
//!
//! ```text
//! job-2 palette: succeeded (1 attempt)
//!     Source: 3b7c9e…
//!     #1a2b3c  41.2%
//!     #f0f0f0  33.0%
//! ```
//!
//! # Architecture
//!
//! `format_*` functions return `Vec<String>` and do no I/O; `print_*`
//! wrappers write them to stdout.

use crate::cache::CacheStats;
use crate::types::{Dimensions, ResultMetadata};
use crate::worker::JobSnapshot;

/// Checksums are shown abbreviated; the full value is in `--json` output.
const CHECKSUM_PREFIX: usize = 12;

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn short(checksum: &str) -> String {
    if checksum.len() <= CHECKSUM_PREFIX {
        checksum.to_string()
    } else {
        format!("{}…", &checksum[..CHECKSUM_PREFIX])
    }
}

fn size(d: Dimensions) -> String {
    format!("{}x{}", d.width, d.height)
}

fn plural(n: u32, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

fn metadata_lines(meta: &ResultMetadata, lines: &mut Vec<String>) {
    let pad = indent(1);
    if let Some(checksum) = &meta.result_checksum {
        lines.push(format!("{pad}Result: {}", short(checksum)));
    }
    match meta.dimensions_after {
        Some(after) => lines.push(format!(
            "{pad}Size: {} → {}",
            size(meta.dimensions_before),
            size(after)
        )),
        None => lines.push(format!("{pad}Size: {}", size(meta.dimensions_before))),
    }
    if let Some(format) = meta.format {
        lines.push(format!("{pad}Format: {format}"));
    }
    if let Some(region) = meta.crop.filter(|r| !r.is_empty()) {
        lines.push(format!(
            "{pad}Trimmed: top {} right {} bottom {} left {}",
            region.top, region.right, region.bottom, region.left
        ));
    }
    if let Some(q) = meta.quality {
        lines.push(format!("{pad}Quality: {q}"));
    }
    if meta.degraded == Some(true) {
        lines.push(format!("{pad}Degraded: interpolation fallback"));
    }
    if let Some(palette) = &meta.palette {
        for entry in palette {
            lines.push(format!("{pad}{}  {:.1}%", entry.hex(), entry.weight * 100.0));
        }
    }
}

/// Format a finished (or still pending) job for the terminal.
pub fn format_job_report(snapshot: &JobSnapshot) -> Vec<String> {
    let mut lines = vec![format!(
        "{} {}: {} ({})",
        snapshot.id,
        snapshot.kind,
        snapshot.status,
        plural(snapshot.attempts, "attempt")
    )];
    lines.push(format!(
        "{}Source: {}",
        indent(1),
        short(&snapshot.source_checksum)
    ));

    if let Some(result) = &snapshot.result {
        metadata_lines(&result.metadata, &mut lines);
        for warning in &result.warnings {
            lines.push(format!("{}Warning: {warning}", indent(1)));
        }
    }
    if let Some(err) = &snapshot.error {
        lines.push(format!("{}Error [{}]: {}", indent(1), err.code, err.message));
    }
    lines
}

pub fn print_job_report(snapshot: &JobSnapshot) {
    for line in format_job_report(snapshot) {
        println!("{}", line);
    }
}

pub fn format_cache_summary(stats: &CacheStats) -> String {
    format!("Cache: {stats}")
}
