//! Compiled-in tunables and the option types built from them

use crate::error::CompressError;
use crate::watermark::WatermarkPolicy;

/// JPEG qualities the search walks, ascending.
pub const QUALITY_LADDER: [u8; 18] = [
    5, 10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90,
];

/// Maximum pixel dimensions tried by the search, largest first.
pub const DIMENSION_PRESETS: [u32; 5] = [800, 600, 400, 300, 200];

/// Direct passes tried after the search, cheapest first.
pub const FALLBACK_LADDER: [CompressionSetting; 4] = [
    CompressionSetting::new(40, 500),
    CompressionSetting::new(25, 300),
    CompressionSetting::new(15, 200),
    CompressionSetting::new(10, 150),
];

/// Quality used by the forced last-resort pass.
pub const FORCED_QUALITY: u8 = 5;

/// Images with fewer pixels than this are icons or decorations and are left alone.
pub const MIN_IMAGE_AREA: u64 = 10_000;

/// A lossy encoding setting applied uniformly to every eligible image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressionSetting {
    /// JPEG quality (1-100)
    pub quality: u8,
    /// Longest allowed side in pixels
    pub max_dimension: u32,
}

impl CompressionSetting {
    pub const fn new(quality: u8, max_dimension: u32) -> Self {
        Self {
            quality,
            max_dimension,
        }
    }

    /// True when both components are strictly below `other`'s.
    pub fn is_more_aggressive_than(&self, other: &CompressionSetting) -> bool {
        self.quality < other.quality && self.max_dimension < other.max_dimension
    }
}

/// Inclusive `[min, max]` byte range the output should land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetWindow {
    pub min: usize,
    pub max: usize,
}

impl TargetWindow {
    pub fn new(min: usize, max: usize) -> Result<Self, CompressError> {
        if min == 0 || min > max {
            return Err(CompressError::InvalidWindow { min, max });
        }
        Ok(Self { min, max })
    }

    /// Window expressed in kibibytes, as the CLI takes it.
    pub fn from_kb(min_kb: usize, max_kb: usize) -> Result<Self, CompressError> {
        Self::new(min_kb.saturating_mul(1024), max_kb.saturating_mul(1024))
    }

    pub fn contains(&self, size: usize) -> bool {
        size >= self.min && size <= self.max
    }

    pub fn midpoint(&self) -> usize {
        self.min + (self.max - self.min) / 2
    }

    /// Absolute distance from the window midpoint.
    pub fn distance(&self, size: usize) -> usize {
        size.abs_diff(self.midpoint())
    }
}

/// Options for size-targeted compression
#[derive(Debug, Clone)]
pub struct CompressOptions {
    /// Ascending quality ladder for the binary search
    pub quality_ladder: Vec<u8>,
    /// Descending maximum-dimension presets for the search
    pub dimension_presets: Vec<u32>,
    /// Strictly decreasing presets tried once each when the search misses
    pub fallback_ladder: Vec<CompressionSetting>,
    /// Quality of the forced halving pass
    pub forced_quality: u8,
    /// Images below this pixel area are never touched
    pub min_image_area: u64,
    /// Watermark pre-pass; `None` disables it
    pub watermark: Option<WatermarkPolicy>,
}

impl Default for CompressOptions {
    fn default() -> Self {
        Self {
            quality_ladder: QUALITY_LADDER.to_vec(),
            dimension_presets: DIMENSION_PRESETS.to_vec(),
            fallback_ladder: FALLBACK_LADDER.to_vec(),
            forced_quality: FORCED_QUALITY,
            min_image_area: MIN_IMAGE_AREA,
            watermark: None,
        }
    }
}

impl CompressOptions {
    /// Enable the watermark pre-pass with the default policy.
    pub fn with_watermark_stripping(mut self) -> Self {
        self.watermark = Some(WatermarkPolicy::default());
        self
    }
}
