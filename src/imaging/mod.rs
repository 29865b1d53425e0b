//! Image processing: pure Rust, no system libraries.
//!
//! | Operation | Module |
//! |---|---|
//! | **Decode / encode / rasterize** | [`codec`] |
//! | **Convert** | [`convert`] |
//! | **Smart crop** | [`crop`] |
//! | **Compress to quality or size** | [`compress`] |
//! | **Dominant colors** | [`palette`] |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for geometry and retry math (unit testable)
//! - **Parameters**: Value types shared by operations
//! - **Codec**: The only place bytes become pixels and back
//! - **Algorithms**: One module per operation, each a pure function of a raster
//!
//! Upscaling lives in [`crate::upscale`] because it talks to an external service.

pub mod calculations;
pub mod codec;
pub mod compress;
pub mod convert;
pub mod crop;
pub mod palette;
mod params;

pub use codec::{ColorSpace, EncodedImage, LimitSettings, RasterImage, decode, decode_within, encode};
pub use compress::{CompressOutput, CompressSettings};
pub use convert::{ConvertOptions, ConvertOutput};
pub use crop::CropSettings;
pub use palette::PaletteSettings;
pub use params::{Constraint, Quality, Rgb};
