//! Image extraction
//!
//! Decodes an image XObject into an RGB or RGBA pixel buffer regardless of the
//! source color space. Anything that cannot be decoded is reported as a
//! [`SkipReason`] and the image stays untouched.

use crate::error::SkipReason;
use crate::scanner::{decompress_stream, image_dimensions, resolve};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage, RgbaImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

/// A decoded, normalized image ready for transcoding.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub id: ObjectId,
    pub width: u32,
    pub height: u32,
    /// Color components in the source color space (1, 3 or 4)
    pub channels: u8,
    pub has_alpha: bool,
    /// `ImageRgb8` or `ImageRgba8`
    pub pixels: DynamicImage,
    /// Bytes currently spent on this image (stream plus soft mask)
    pub encoded_len: usize,
}

/// Source color space of an image XObject.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorSpace {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<ColorSpace>,
        hival: usize,
        lookup: Vec<u8>,
    },
    Unsupported(String),
}

impl ColorSpace {
    pub fn components(&self) -> u8 {
        match self {
            ColorSpace::Gray | ColorSpace::Indexed { .. } => 1,
            ColorSpace::Rgb => 3,
            ColorSpace::Cmyk => 4,
            ColorSpace::Unsupported(_) => 0,
        }
    }

    /// Resolve a `/ColorSpace` entry.
    pub fn from_object(obj: &Object, doc: &Document) -> ColorSpace {
        let Some(obj) = resolve(doc, obj) else {
            return ColorSpace::Unsupported("dangling reference".to_string());
        };
        match obj {
            Object::Name(name) => Self::from_family(name),
            Object::Array(arr) => {
                let family = arr.first().and_then(|f| f.as_name().ok()).unwrap_or_default();
                match family {
                    b"ICCBased" => arr
                        .get(1)
                        .and_then(|s| resolve(doc, s))
                        .and_then(|s| s.as_stream().ok())
                        .and_then(|s| s.dict.get(b"N").and_then(Object::as_i64).ok())
                        .map(|n| match n {
                            1 => ColorSpace::Gray,
                            3 => ColorSpace::Rgb,
                            4 => ColorSpace::Cmyk,
                            other => ColorSpace::Unsupported(format!("ICCBased with N={}", other)),
                        })
                        .unwrap_or_else(|| ColorSpace::Unsupported("ICCBased without N".to_string())),
                    b"Indexed" | b"I" if arr.len() >= 4 => {
                        let base = ColorSpace::from_object(&arr[1], doc);
                        let hival = arr[2].as_i64().unwrap_or(0).clamp(0, 255) as usize;
                        let lookup = match resolve(doc, &arr[3]) {
                            Some(Object::String(bytes, _)) => bytes.clone(),
                            Some(Object::Stream(s)) => decompress_stream(s),
                            _ => Vec::new(),
                        };
                        ColorSpace::Indexed {
                            base: Box::new(base),
                            hival,
                            lookup,
                        }
                    }
                    b"CalRGB" => ColorSpace::Rgb,
                    b"CalGray" => ColorSpace::Gray,
                    other => ColorSpace::Unsupported(String::from_utf8_lossy(other).to_string()),
                }
            }
            _ => ColorSpace::Unsupported("unrecognized color space object".to_string()),
        }
    }

    fn from_family(name: &[u8]) -> ColorSpace {
        match name {
            b"DeviceGray" | b"G" | b"CalGray" => ColorSpace::Gray,
            b"DeviceRGB" | b"RGB" | b"CalRGB" => ColorSpace::Rgb,
            b"DeviceCMYK" | b"CMYK" => ColorSpace::Cmyk,
            other => ColorSpace::Unsupported(String::from_utf8_lossy(other).to_string()),
        }
    }
}

/// Get color space name from PDF object
pub fn color_space_name(obj: &Object, doc: &Document) -> String {
    match obj {
        Object::Name(name) => String::from_utf8_lossy(name).to_string(),
        Object::Array(arr) => match arr.first() {
            Some(Object::Name(name)) => String::from_utf8_lossy(name).to_string(),
            _ => "Unknown".to_string(),
        },
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(resolved) => color_space_name(resolved, doc),
            Err(_) => "Unknown".to_string(),
        },
        _ => "Unknown".to_string(),
    }
}

/// First filter of a stream, by name.
pub fn primary_filter(stream: &Stream) -> Option<Vec<u8>> {
    match stream.dict.get(b"Filter").ok()? {
        Object::Name(n) => Some(n.clone()),
        Object::Array(arr) => arr.first().and_then(|f| f.as_name().ok()).map(|n| n.to_vec()),
        _ => None,
    }
}

/// CMYK bytes to RGB bytes using the naive device transform.
pub fn cmyk_to_rgb(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 4 * 3);
    for chunk in data.chunks_exact(4) {
        let c = chunk[0] as f32 / 255.0;
        let m = chunk[1] as f32 / 255.0;
        let y = chunk[2] as f32 / 255.0;
        let k = chunk[3] as f32 / 255.0;

        rgb.push(((1.0 - c) * (1.0 - k) * 255.0).round() as u8);
        rgb.push(((1.0 - m) * (1.0 - k) * 255.0).round() as u8);
        rgb.push(((1.0 - y) * (1.0 - k) * 255.0).round() as u8);
    }
    rgb
}

/// Extract and normalize one image. Images below `min_area` pixels are skipped.
pub fn extract_image(doc: &Document, id: ObjectId, min_area: u64) -> Result<ImageAsset, SkipReason> {
    let stream = match doc.get_object(id) {
        Ok(Object::Stream(s)) => s,
        _ => return Err(SkipReason::Missing(id)),
    };

    let (width, height) = image_dimensions(&stream.dict)
        .ok_or_else(|| SkipReason::DecodeFailure("missing Width/Height".to_string()))?;

    if (width as u64) * (height as u64) < min_area {
        return Err(SkipReason::TooSmall {
            width,
            height,
            min_area,
        });
    }

    if matches!(stream.dict.get(b"ImageMask"), Ok(Object::Boolean(true))) {
        return Err(SkipReason::UnsupportedColorSpace("stencil mask".to_string()));
    }

    let color_space = stream
        .dict
        .get(b"ColorSpace")
        .map(|cs| ColorSpace::from_object(cs, doc))
        .unwrap_or(ColorSpace::Rgb);

    let bits_per_component = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);

    let mapping = SampleMapping::from_dict(&stream.dict, &color_space)?;
    let (decoded, key_alpha) =
        decode_image_stream(stream, width, height, &color_space, bits_per_component, &mapping)?;

    let mut encoded_len = stream.content.len();
    let mut alpha = key_alpha;
    // A soft mask takes precedence over /Mask
    if let Ok(smask) = stream.dict.get(b"SMask").and_then(Object::as_reference) {
        let Ok(Object::Stream(smask_stream)) = doc.get_object(smask) else {
            return Err(SkipReason::Missing(smask));
        };
        encoded_len += smask_stream.content.len();
        alpha = Some(decode_smask_stream(smask_stream, width, height)?);
    } else if let Ok(mask) = stream.dict.get(b"Mask").and_then(Object::as_reference) {
        let Ok(Object::Stream(mask_stream)) = doc.get_object(mask) else {
            return Err(SkipReason::Missing(mask));
        };
        encoded_len += mask_stream.content.len();
        alpha = Some(decode_stencil_mask(mask_stream, width, height)?);
    }

    let (pixels, has_alpha) = match alpha {
        Some(mask) => {
            let rgb = decoded.to_rgb8();
            let mut rgba = RgbaImage::new(width, height);
            for ((out, px), a) in rgba.pixels_mut().zip(rgb.pixels()).zip(mask.pixels()) {
                out.0 = [px[0], px[1], px[2], a[0]];
            }
            (DynamicImage::ImageRgba8(rgba), true)
        }
        None if decoded.color().has_alpha() => (DynamicImage::ImageRgba8(decoded.to_rgba8()), true),
        None => (DynamicImage::ImageRgb8(decoded.to_rgb8()), false),
    };

    Ok(ImageAsset {
        id,
        width: pixels.width(),
        height: pixels.height(),
        channels: match color_space.components() {
            0 => 3,
            n => n,
        },
        has_alpha,
        pixels,
        encoded_len,
    })
}

/// Decode a PDF image stream into pixel data, plus the alpha of a color-key mask.
fn decode_image_stream(
    stream: &Stream,
    width: u32,
    height: u32,
    color_space: &ColorSpace,
    bits_per_component: i64,
    mapping: &SampleMapping,
) -> Result<(DynamicImage, Option<GrayImage>), SkipReason> {
    let filter = primary_filter(stream);

    match filter.as_deref() {
        Some(b"DCTDecode") => {
            let decoded = image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
                .map_err(|e| SkipReason::DecodeFailure(format!("JPEG: {}", e)))?;
            return map_decoded_jpeg(decoded, mapping);
        }
        Some(b"JPXDecode") | Some(b"JBIG2Decode") | Some(b"CCITTFaxDecode") => {
            let name = filter.as_deref().unwrap_or_default();
            return Err(SkipReason::UnsupportedColorSpace(format!(
                "{} encoded image",
                String::from_utf8_lossy(name)
            )));
        }
        _ => {}
    }

    if let ColorSpace::Unsupported(name) = color_space {
        return Err(SkipReason::UnsupportedColorSpace(name.clone()));
    }
    if bits_per_component != 8 {
        return Err(SkipReason::UnsupportedColorSpace(format!(
            "{} bits per component",
            bits_per_component
        )));
    }

    let mut data = decompress_stream(stream);
    let expected_size = width as usize * height as usize * color_space.components() as usize;
    if data.len() < expected_size {
        return Err(SkipReason::DecodeFailure(format!(
            "pixel data size mismatch: got {} expected {}",
            data.len(),
            expected_size
        )));
    }
    data.truncate(expected_size);

    let key_alpha = mapping.apply(&mut data, width, height);
    Ok((raw_pixels_to_image(&data, width, height, color_space)?, key_alpha))
}

/// JPEG samples come out of the decoder already converted; only gray and RGB
/// keep a one-to-one mapping to the PDF components.
fn map_decoded_jpeg(
    decoded: DynamicImage,
    mapping: &SampleMapping,
) -> Result<(DynamicImage, Option<GrayImage>), SkipReason> {
    if mapping.is_identity() {
        return Ok((decoded, None));
    }
    match (decoded, mapping.components) {
        (DynamicImage::ImageLuma8(mut gray), 1) => {
            let (w, h) = gray.dimensions();
            let alpha = mapping.apply(&mut gray, w, h);
            Ok((DynamicImage::ImageLuma8(gray), alpha))
        }
        (DynamicImage::ImageRgb8(mut rgb), 3) => {
            let (w, h) = rgb.dimensions();
            let alpha = mapping.apply(&mut rgb, w, h);
            Ok((DynamicImage::ImageRgb8(rgb), alpha))
        }
        (_, n) => Err(SkipReason::UnsupportedColorSpace(format!(
            "Decode or color-key mask on a {}-component JPEG",
            n
        ))),
    }
}

/// The `/Decode` array and a color-key `/Mask`, both defined on raw samples.
#[derive(Debug, Clone, Default, PartialEq)]
struct SampleMapping {
    components: usize,
    /// Output range per component; `None` for the identity mapping
    decode: Option<Vec<(f32, f32)>>,
    /// Inclusive sample range per component that is masked out
    color_key: Option<Vec<(u8, u8)>>,
}

impl SampleMapping {
    fn from_dict(dict: &Dictionary, color_space: &ColorSpace) -> Result<Self, SkipReason> {
        let components = color_space.components() as usize;

        let decode = match dict.get(b"Decode") {
            Ok(Object::Array(arr)) => {
                let values = numbers(arr, |o| o.as_float().ok())
                    .ok_or_else(|| SkipReason::DecodeFailure("non-numeric Decode array".to_string()))?;
                decode_ranges(&values, color_space)?
            }
            _ => None,
        };

        let color_key = match dict.get(b"Mask") {
            Ok(Object::Array(arr)) => {
                let values = numbers(arr, |o| o.as_i64().ok())
                    .filter(|v| v.len() >= 2 * components)
                    .ok_or_else(|| SkipReason::DecodeFailure("malformed color-key mask".to_string()))?;
                let clamp = |v: i64| v.clamp(0, 255) as u8;
                Some(
                    values
                        .chunks_exact(2)
                        .take(components)
                        .map(|r| (clamp(r[0]), clamp(r[1])))
                        .collect(),
                )
            }
            _ => None,
        };

        Ok(SampleMapping {
            components,
            decode,
            color_key,
        })
    }

    fn is_identity(&self) -> bool {
        self.decode.is_none() && self.color_key.is_none()
    }

    /// Build the color-key alpha from the raw samples, then map them through `/Decode`.
    fn apply(&self, samples: &mut [u8], width: u32, height: u32) -> Option<GrayImage> {
        let n = self.components.max(1);

        let alpha = self.color_key.as_ref().and_then(|ranges| {
            let values = samples
                .chunks_exact(n)
                .map(|px| {
                    let keyed = px.iter().zip(ranges).all(|(s, &(lo, hi))| (lo..=hi).contains(s));
                    if keyed {
                        0
                    } else {
                        255
                    }
                })
                .collect();
            GrayImage::from_raw(width, height, values)
        });

        if let Some(ranges) = &self.decode {
            for px in samples.chunks_exact_mut(n) {
                for (sample, &(lo, hi)) in px.iter_mut().zip(ranges) {
                    let value = lo + (*sample as f32 / 255.0) * (hi - lo);
                    *sample = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
                }
            }
        }

        alpha
    }
}

fn numbers<T>(arr: &[Object], parse: impl Fn(&Object) -> Option<T>) -> Option<Vec<T>> {
    arr.iter().map(parse).collect()
}

/// Per-component ranges of a `/Decode` array, `None` when it is the default.
fn decode_ranges(values: &[f32], color_space: &ColorSpace) -> Result<Option<Vec<(f32, f32)>>, SkipReason> {
    if let ColorSpace::Indexed { .. } = color_space {
        // Index samples default to [0, 2^bpc - 1]
        return match values {
            [lo, hi] if *lo == 0.0 && *hi == 255.0 => Ok(None),
            _ => Err(SkipReason::UnsupportedColorSpace(
                "Indexed image with a Decode array".to_string(),
            )),
        };
    }

    let components = color_space.components() as usize;
    if values.len() < 2 * components {
        return Err(SkipReason::DecodeFailure("Decode array too short".to_string()));
    }
    let ranges: Vec<(f32, f32)> = values
        .chunks_exact(2)
        .take(components)
        .map(|r| (r[0], r[1]))
        .collect();
    if ranges.iter().all(|&(lo, hi)| lo == 0.0 && hi == 1.0) {
        Ok(None)
    } else {
        Ok(Some(ranges))
    }
}

/// Decode an explicit `/Mask` stream (1-bit stencil) into alpha at the image's size.
///
/// A sample of 1 masks the pixel out, unless the mask's `/Decode` is `[1 0]`.
fn decode_stencil_mask(stream: &Stream, width: u32, height: u32) -> Result<GrayImage, SkipReason> {
    let (mw, mh) = image_dimensions(&stream.dict)
        .ok_or_else(|| SkipReason::DecodeFailure("stencil mask without dimensions".to_string()))?;

    if let Some(filter @ (b"CCITTFaxDecode" | b"JBIG2Decode" | b"DCTDecode" | b"JPXDecode")) =
        primary_filter(stream).as_deref()
    {
        return Err(SkipReason::UnsupportedColorSpace(format!(
            "{} encoded stencil mask",
            String::from_utf8_lossy(filter)
        )));
    }

    let bits = decompress_stream(stream);
    let row_bytes = (mw as usize).div_ceil(8);
    if bits.len() < row_bytes * mh as usize {
        return Err(SkipReason::DecodeFailure(format!(
            "stencil mask data size mismatch: got {} expected {}",
            bits.len(),
            row_bytes * mh as usize
        )));
    }

    let inverted = matches!(
        stream.dict.get(b"Decode"),
        Ok(Object::Array(arr)) if arr.first().and_then(|o| o.as_float().ok()) == Some(1.0)
    );
    let mask = GrayImage::from_fn(mw, mh, |x, y| {
        let byte = bits[y as usize * row_bytes + x as usize / 8];
        let set = byte & (0x80 >> (x % 8)) != 0;
        if set != inverted {
            Luma([0])
        } else {
            Luma([255])
        }
    });

    if mask.dimensions() == (width, height) {
        Ok(mask)
    } else {
        Ok(image::imageops::resize(
            &mask,
            width,
            height,
            image::imageops::FilterType::Nearest,
        ))
    }
}

fn raw_pixels_to_image(
    data: &[u8],
    width: u32,
    height: u32,
    color_space: &ColorSpace,
) -> Result<DynamicImage, SkipReason> {
    let pixels = width as usize * height as usize;
    let expected_size = pixels * color_space.components() as usize;
    if data.len() < expected_size {
        return Err(SkipReason::DecodeFailure(format!(
            "pixel data size mismatch: got {} expected {}",
            data.len(),
            expected_size
        )));
    }
    let data = &data[..expected_size];
    let size_error = || SkipReason::DecodeFailure("buffer does not match dimensions".to_string());

    match color_space {
        ColorSpace::Gray => GrayImage::from_raw(width, height, data.to_vec())
            .map(DynamicImage::ImageLuma8)
            .ok_or_else(size_error),
        ColorSpace::Rgb => RgbImage::from_raw(width, height, data.to_vec())
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(size_error),
        ColorSpace::Cmyk => RgbImage::from_raw(width, height, cmyk_to_rgb(data))
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(size_error),
        ColorSpace::Indexed {
            base,
            hival,
            lookup,
        } => {
            let stride = match base.as_ref() {
                ColorSpace::Gray => 1,
                ColorSpace::Rgb => 3,
                ColorSpace::Cmyk => 4,
                other => {
                    return Err(SkipReason::UnsupportedColorSpace(format!(
                        "Indexed over {:?}",
                        other
                    )))
                }
            };
            let mut palette = Vec::with_capacity(data.len() * stride);
            for &index in data {
                let index = (index as usize).min(*hival);
                let entry = lookup
                    .get(index * stride..(index + 1) * stride)
                    .ok_or_else(|| SkipReason::DecodeFailure("palette index out of range".to_string()))?;
                palette.extend_from_slice(entry);
            }
            raw_pixels_to_image(&palette, width, height, base)
        }
        ColorSpace::Unsupported(name) => Err(SkipReason::UnsupportedColorSpace(name.clone())),
    }
}

/// Decode an SMask stream (grayscale alpha channel) at the image's size
fn decode_smask_stream(stream: &Stream, width: u32, height: u32) -> Result<GrayImage, SkipReason> {
    let (mw, mh) = image_dimensions(&stream.dict)
        .ok_or_else(|| SkipReason::DecodeFailure("soft mask without dimensions".to_string()))?;

    let mask = match primary_filter(stream).as_deref() {
        Some(b"DCTDecode") => image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)
            .map_err(|e| SkipReason::DecodeFailure(format!("soft mask JPEG: {}", e)))?
            .to_luma8(),
        _ => {
            let data = decompress_stream(stream);
            let expected_size = mw as usize * mh as usize;
            if data.len() < expected_size {
                return Err(SkipReason::DecodeFailure(format!(
                    "SMask data size mismatch: got {} expected {}",
                    data.len(),
                    expected_size
                )));
            }
            GrayImage::from_raw(mw, mh, data[..expected_size].to_vec())
                .ok_or_else(|| SkipReason::DecodeFailure("soft mask buffer".to_string()))?
        }
    };

    if mask.dimensions() == (width, height) {
        Ok(mask)
    } else {
        Ok(image::imageops::resize(
            &mask,
            width,
            height,
            image::imageops::FilterType::Triangle,
        ))
    }
}
