//! Lossy re-encoding of extracted images

use crate::error::SkipReason;
use crate::extract::ImageAsset;
use crate::options::CompressionSetting;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::borrow::Cow;

/// A JPEG blob and the pixel size it encodes.
#[derive(Debug, Clone)]
pub struct Transcoded {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Per-image result of one transcode attempt.
#[derive(Debug, Clone)]
pub enum ImageOutcome {
    Transcoded(Transcoded),
    Skipped(SkipReason),
}

/// Downscale so neither side exceeds `max_dimension`, preserving aspect ratio.
pub fn fit_within(img: &DynamicImage, max_dimension: u32) -> Cow<'_, DynamicImage> {
    let max_dimension = max_dimension.max(1);
    if img.width() > max_dimension || img.height() > max_dimension {
        Cow::Owned(img.resize(max_dimension, max_dimension, FilterType::Lanczos3))
    } else {
        Cow::Borrowed(img)
    }
}

/// Composite any alpha channel onto opaque white.
pub fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (out, px) in rgb.pixels_mut().zip(rgba.pixels()) {
        let alpha = px[3] as u16;
        for channel in 0..3 {
            let blended = (px[channel] as u16 * alpha + 255 * (255 - alpha) + 127) / 255;
            out[channel] = blended as u8;
        }
    }
    rgb
}

/// Encode RGB pixels as a baseline JPEG with optimized Huffman tables.
pub fn encode_jpeg(rgb: &RgbImage, quality: u8) -> Result<Vec<u8>, SkipReason> {
    let (width, height) = rgb.dimensions();
    let (w, h) = match (u16::try_from(width), u16::try_from(height)) {
        (Ok(w), Ok(h)) if w > 0 && h > 0 => (w, h),
        _ => {
            return Err(SkipReason::EncodeFailure(format!(
                "{}x{} is outside JPEG limits",
                width, height
            )))
        }
    };

    let mut jpeg_bytes = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut jpeg_bytes, quality.clamp(1, 100));
    encoder.set_sampling_factor(jpeg_encoder::SamplingFactor::R_4_2_0);
    encoder.set_optimized_huffman_tables(true);
    encoder
        .encode(rgb.as_raw(), w, h, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| SkipReason::EncodeFailure(e.to_string()))?;

    Ok(jpeg_bytes)
}

/// Resize, flatten and encode a pixel buffer at `setting`.
pub fn transcode(img: &DynamicImage, setting: CompressionSetting) -> Result<Transcoded, SkipReason> {
    let resized = fit_within(img, setting.max_dimension);
    let rgb = flatten_onto_white(&resized);
    let data = encode_jpeg(&rgb, setting.quality)?;

    Ok(Transcoded {
        data,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Transcode an asset, keeping the original when the result would not be smaller.
pub fn transcode_asset(asset: &ImageAsset, setting: CompressionSetting) -> ImageOutcome {
    match transcode(&asset.pixels, setting) {
        Ok(t) if t.data.len() >= asset.encoded_len => ImageOutcome::Skipped(SkipReason::NoGain {
            old: asset.encoded_len,
            new: t.data.len(),
        }),
        Ok(t) => ImageOutcome::Transcoded(t),
        Err(reason) => ImageOutcome::Skipped(reason),
    }
}

/// Setting that halves an asset's current resolution at `quality`.
pub fn halving_setting(asset: &ImageAsset, quality: u8) -> CompressionSetting {
    let longest = asset.width.max(asset.height);
    CompressionSetting::new(quality, (longest / 2).max(1))
}
