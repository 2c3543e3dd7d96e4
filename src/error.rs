//! Error types for size-targeted compression

use lopdf::ObjectId;
use thiserror::Error;

/// Stage-level and total failures.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Target window is invalid: min {min} bytes, max {max} bytes")]
    InvalidWindow { min: usize, max: usize },

    #[error("Failed to load PDF: {0}")]
    Load(String),

    #[error("Failed to save PDF: {0}")]
    Save(String),
}

/// Why a single image was left untouched.
///
/// Skips are never fatal: the image keeps its original stream and the
/// surrounding pass moves on to the next one.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkipReason {
    #[error("image object {0:?} is missing or not a stream")]
    Missing(ObjectId),

    #[error("{width}x{height} is below the minimum area of {min_area} px")]
    TooSmall { width: u32, height: u32, min_area: u64 },

    #[error("could not decode pixels: {0}")]
    DecodeFailure(String),

    #[error("unsupported color space: {0}")]
    UnsupportedColorSpace(String),

    #[error("could not encode JPEG: {0}")]
    EncodeFailure(String),

    #[error("re-encoded size {new} is not smaller than {old}")]
    NoGain { old: usize, new: usize },
}
