//! Per-page image inventory, used by `--inspect` and the wasm bindings

use crate::error::CompressError;
use crate::extract::{color_space_name, primary_filter};
use crate::scanner::{collect_page_images, image_dimensions, scan_placements, Rect};
use lopdf::{Document, Object, ObjectId, Stream};
use std::fmt;

/// What an image stream is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Image,
    SoftMask,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Image => f.write_str("image"),
            ImageKind::SoftMask => f.write_str("smask"),
        }
    }
}

/// Information about a single image in the PDF
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub object_id: ObjectId,
    pub kind: ImageKind,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    pub color_space: String,
    pub bits_per_component: u32,
    /// First filter, or `raw`
    pub filter: String,
    /// Encoded stream length
    pub size_bytes: usize,
    /// Where the image is drawn on this page
    pub placements: Vec<Rect>,
}

/// Images grouped by page
#[derive(Debug, Clone)]
pub struct PageImages {
    pub page_number: u32,
    pub images: Vec<ImageInfo>,
}

impl PageImages {
    pub fn total_bytes(&self) -> usize {
        self.images.iter().map(|i| i.size_bytes).sum()
    }
}

/// List every image (and soft mask) reachable from each page.
///
/// Pages without images are omitted; pages come back in page order.
pub fn image_inventory(pdf_bytes: &[u8]) -> Result<Vec<PageImages>, CompressError> {
    let doc = Document::load_mem(pdf_bytes).map_err(|e| CompressError::Load(e.to_string()))?;
    let placements = scan_placements(&doc);

    let mut result = Vec::new();
    for (page_number, page_id) in doc.get_pages() {
        let mut images = Vec::new();

        for obj_id in collect_page_images(&doc, page_id) {
            let Ok(Object::Stream(stream)) = doc.get_object(obj_id) else {
                continue;
            };
            let rects = placements
                .get(&obj_id)
                .map(|all| {
                    all.iter()
                        .filter(|p| p.page == page_number)
                        .map(|p| p.rect)
                        .collect()
                })
                .unwrap_or_default();
            images.push(describe(obj_id, stream, &doc, ImageKind::Image, rects));

            if let Ok(Object::Reference(smask_id)) = stream.dict.get(b"SMask") {
                if let Ok(Object::Stream(smask)) = doc.get_object(*smask_id) {
                    images.push(describe(*smask_id, smask, &doc, ImageKind::SoftMask, Vec::new()));
                }
            }
        }

        if !images.is_empty() {
            result.push(PageImages {
                page_number,
                images,
            });
        }
    }

    Ok(result)
}

fn describe(
    object_id: ObjectId,
    stream: &Stream,
    doc: &Document,
    kind: ImageKind,
    placements: Vec<Rect>,
) -> ImageInfo {
    let (width, height) = image_dimensions(&stream.dict).unwrap_or((0, 0));

    let color_space = match kind {
        ImageKind::SoftMask => "DeviceGray".to_string(),
        ImageKind::Image => stream
            .dict
            .get(b"ColorSpace")
            .map(|cs| color_space_name(cs, doc))
            .unwrap_or_else(|_| "Unknown".to_string()),
    };

    let bits_per_component = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .map_or(8, |b| b as u32);

    let filter = primary_filter(stream)
        .map(|f| String::from_utf8_lossy(&f).to_string())
        .unwrap_or_else(|| "raw".to_string());

    ImageInfo {
        object_id,
        kind,
        width,
        height,
        color_space,
        bits_per_component,
        filter,
        size_bytes: stream.content.len(),
        placements,
    }
}
