//! PDF Size-Target Compressor Library
//!
//! Recompresses the raster images of a PDF until the serialized document
//! lands inside a byte-size window. Text, vector graphics and page geometry
//! are never rewritten. Shared between the CLI and WASM targets.
//!
//! The pipeline is: optional watermark strip, naive recompaction, a binary
//! search over JPEG quality for each dimension preset, a fixed fallback
//! ladder and finally a forced halving pass. See [`SizeTargetCompressor`].

pub mod compressor;
pub mod error;
pub mod extract;
pub mod inventory;
pub mod options;
pub mod replace;
pub mod scanner;
pub mod search;
pub mod transcode;
pub mod watermark;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

#[cfg(test)]
mod fixtures;

pub use compressor::{Compressed, SizeTargetCompressor};
pub use error::{CompressError, SkipReason};
pub use inventory::{image_inventory, ImageInfo, PageImages};
pub use options::{CompressOptions, CompressionSetting, TargetWindow};
pub use search::Stage;
pub use transcode::ImageOutcome;
pub use watermark::{StripReport, WatermarkPolicy};

/// Compress `input` toward `window` with the compiled-in defaults.
pub fn compress(input: &[u8], window: TargetWindow) -> Result<Vec<u8>, CompressError> {
    compress_with_options(input, window, &CompressOptions::default()).map(|c| c.bytes)
}

/// Compress `input` toward `window`, reporting which stage produced the result.
pub fn compress_with_options(
    input: &[u8],
    window: TargetWindow,
    options: &CompressOptions,
) -> Result<Compressed, CompressError> {
    SizeTargetCompressor::new(options.clone()).compress(input, window)
}
