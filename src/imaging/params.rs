//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how*. They sit between the
//! [`registry`](crate::registry) (which validates and canonicalizes them) and
//! the algorithm modules (which do the pixel work).
//!
//! ## Types
//!
//! - [`Quality`]: Encoding quality (1–100, default 90). Clamped on construction.
//! - [`Rgb`]: Opaque color, parsed from and printed as `#rrggbb`.
//! - [`Constraint`]: Compression target: fixed quality or a byte ceiling.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Quality setting for encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quality(u8);

impl Quality {
    pub const MIN: Quality = Quality(1);
    pub const MAX: Quality = Quality(100);

    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(90)
    }
}

/// An opaque sRGB color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb(pub [u8; 3]);

impl Rgb {
    pub const WHITE: Rgb = Rgb([255, 255, 255]);

    /// Parse `#rrggbb` or `rrggbb`, case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self([channel(0)?, channel(2)?, channel(4)?]))
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Self::WHITE
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0[0], self.0[1], self.0[2])
    }
}

// Always lowercase hex on the wire so equal colors canonicalize identically.
impl Serialize for Rgb {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rgb {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Rgb::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid color: {s}")))
    }
}

/// What the compression tuner should aim for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Encode once at this quality (1-100).
    Quality(u32),
    /// Highest quality whose encoding fits in this many bytes.
    MaxBytes(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_90() {
        assert_eq!(Quality::default().value(), 90);
    }

    #[test]
    fn rgb_parse_accepts_both_forms() {
        assert_eq!(Rgb::parse("#FF8000"), Some(Rgb([255, 128, 0])));
        assert_eq!(Rgb::parse("ff8000"), Some(Rgb([255, 128, 0])));
        assert_eq!(Rgb::parse("#fff"), None);
        assert_eq!(Rgb::parse("#gg0000"), None);
    }

    #[test]
    fn rgb_serializes_lowercase() {
        let json = serde_json::to_string(&Rgb::parse("#ABCDEF").unwrap()).unwrap();
        assert_eq!(json, "\"#abcdef\"");
        let back: Rgb = serde_json::from_str("\"#ABCDEF\"").unwrap();
        assert_eq!(back, Rgb([0xab, 0xcd, 0xef]));
    }

    #[test]
    fn constraint_wire_format() {
        let json = serde_json::to_string(&Constraint::MaxBytes(2048)).unwrap();
        assert_eq!(json, r#"{"max_bytes":2048}"#);
    }
}
