//! In-memory PDF builders for unit tests

use crate::scanner::Rect;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::io::Write;

/// Raw pixels for an image XObject.
#[derive(Debug, Clone)]
pub struct TestImage {
    pub width: u32,
    pub height: u32,
    pub color_space: &'static str,
    pub data: Vec<u8>,
    pub alpha: Option<Vec<u8>>,
}

struct XorShift(u32);

impl XorShift {
    fn new(seed: u32) -> Self {
        XorShift(seed.wrapping_mul(2_654_435_761).max(1))
    }

    fn next_byte(&mut self) -> u8 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 >> 24) as u8
    }
}

impl TestImage {
    pub fn noise_rgb(width: u32, height: u32, seed: u32) -> Self {
        let mut rng = XorShift::new(seed);
        let data = (0..width * height * 3).map(|_| rng.next_byte()).collect();
        TestImage {
            width,
            height,
            color_space: "DeviceRGB",
            data,
            alpha: None,
        }
    }

    pub fn noise_rgba(width: u32, height: u32, seed: u32) -> Self {
        let mut image = Self::noise_rgb(width, height, seed);
        let mut rng = XorShift::new(seed ^ 0xA5A5);
        image.alpha = Some((0..width * height).map(|_| rng.next_byte()).collect());
        image
    }

    /// Smooth gradient with light grain, closer to a photo than pure noise.
    pub fn photo_rgb(width: u32, height: u32, seed: u32) -> Self {
        let mut rng = XorShift::new(seed);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let grain = (rng.next_byte() % 24) as u32;
                data.push(((x * 255 / width.max(1)) + grain).min(255) as u8);
                data.push(((y * 255 / height.max(1)) + grain).min(255) as u8);
                data.push((((x + y) * 127 / (width + height).max(1)) + grain).min(255) as u8);
            }
        }
        TestImage {
            width,
            height,
            color_space: "DeviceRGB",
            data,
            alpha: None,
        }
    }

    pub fn solid_gray(width: u32, height: u32, value: u8) -> Self {
        TestImage {
            width,
            height,
            color_space: "DeviceGray",
            data: vec![value; (width * height) as usize],
            alpha: None,
        }
    }

    pub fn solid_cmyk(width: u32, height: u32, cmyk: [u8; 4]) -> Self {
        TestImage {
            width,
            height,
            color_space: "DeviceCMYK",
            data: cmyk.repeat((width * height) as usize),
            alpha: None,
        }
    }

    pub fn to_dynamic(&self) -> DynamicImage {
        let (w, h) = (self.width, self.height);
        let base = match self.color_space {
            "DeviceGray" => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, self.data.clone()).unwrap()),
            "DeviceCMYK" => DynamicImage::ImageRgb8(
                RgbImage::from_raw(w, h, crate::extract::cmyk_to_rgb(&self.data)).unwrap(),
            ),
            _ => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, self.data.clone()).unwrap()),
        };
        match &self.alpha {
            Some(alpha) => {
                let rgb = base.to_rgb8();
                let mut rgba = RgbaImage::new(w, h);
                for ((out, px), a) in rgba.pixels_mut().zip(rgb.pixels()).zip(alpha) {
                    out.0 = [px[0], px[1], px[2], *a];
                }
                DynamicImage::ImageRgba8(rgba)
            }
            None => base,
        }
    }
}

fn flate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn real(v: f32) -> Object {
    Object::Real(v)
}

fn rect_array(rect: Rect) -> Object {
    Object::Array(vec![real(rect.x0), real(rect.y0), real(rect.x1), real(rect.y1)])
}

#[derive(Default)]
struct PageDraft {
    operations: Vec<Operation>,
    xobjects: Dictionary,
    ext_gstates: Dictionary,
    annots: Vec<Object>,
    no_media_box: bool,
}

/// Builds small documents page by page.
pub struct PdfBuilder {
    doc: Document,
    media_box: Rect,
    pages: Vec<PageDraft>,
    inherit_media_box: bool,
    fields: Vec<Object>,
    forms: usize,
}

impl PdfBuilder {
    /// A document with one empty page of the given size.
    pub fn new(width: f32, height: f32) -> Self {
        Self::with_media_box(Rect::new(0.0, 0.0, width, height))
    }

    /// A document with one empty page covering `media_box`.
    pub fn with_media_box(media_box: Rect) -> Self {
        PdfBuilder {
            doc: Document::with_version("1.5"),
            media_box,
            pages: vec![PageDraft::default()],
            inherit_media_box: false,
            fields: Vec::new(),
            forms: 0,
        }
    }

    /// Append an empty page and return its index.
    pub fn add_page(&mut self) -> usize {
        self.pages.push(PageDraft::default());
        self.pages.len() - 1
    }

    /// Put the MediaBox on the page tree root instead of on each page.
    pub fn inherit_media_box(&mut self) {
        self.inherit_media_box = true;
    }

    pub fn remove_media_box(&mut self, page: usize) {
        self.pages[page].no_media_box = true;
    }

    pub fn add_image(&mut self, image: &TestImage) -> ObjectId {
        let mut dict = dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => Object::Integer(image.width as i64),
            "Height" => Object::Integer(image.height as i64),
            "ColorSpace" => image.color_space,
            "BitsPerComponent" => Object::Integer(8),
            "Filter" => "FlateDecode",
        };
        if let Some(alpha) = &image.alpha {
            let smask = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => Object::Integer(image.width as i64),
                    "Height" => Object::Integer(image.height as i64),
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => Object::Integer(8),
                    "Filter" => "FlateDecode",
                },
                flate(alpha),
            );
            let smask_id = self.doc.add_object(smask);
            dict.set("SMask", Object::Reference(smask_id));
        }
        self.doc.add_object(Stream::new(dict, flate(&image.data)))
    }

    /// Set an extra entry (`Decode`, `Mask`, ...) on an image dictionary.
    pub fn set_image_entry(&mut self, id: ObjectId, key: &str, value: Object) {
        if let Ok(Object::Stream(stream)) = self.doc.get_object_mut(id) {
            stream.dict.set(key, value);
        }
    }

    /// A 1-bit stencil mask; `bits` holds packed rows, a set bit masks the pixel out.
    pub fn add_stencil_mask(&mut self, width: u32, height: u32, bits: Vec<u8>) -> ObjectId {
        self.doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => Object::Integer(width as i64),
                "Height" => Object::Integer(height as i64),
                "ImageMask" => true,
                "BitsPerComponent" => Object::Integer(1),
                "Filter" => "FlateDecode",
            },
            flate(&bits),
        ))
    }

    /// Draw an image so it fills `rect` on the page.
    pub fn place_image(&mut self, page: usize, id: ObjectId, rect: Rect) {
        let name = format!("Im{}", id.0);
        let draft = &mut self.pages[page];
        draft.xobjects.set(name.as_bytes().to_vec(), Object::Reference(id));
        draft.operations.extend(draw_ops(&name, rect));
    }

    /// Draw an image through a Form XObject placed on the page.
    pub fn place_image_in_form(&mut self, page: usize, id: ObjectId, rect: Rect) {
        let image_name = format!("Im{}", id.0);
        let content = Content {
            operations: draw_ops(&image_name, rect),
        }
        .encode()
        .unwrap();
        let form = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Form",
                "BBox" => rect_array(self.media_box),
                "Resources" => dictionary! {
                    "XObject" => dictionary! { image_name.as_str() => Object::Reference(id) },
                },
            },
            content,
        );
        let form_id = self.doc.add_object(form);

        self.forms += 1;
        let form_name = format!("Fm{}", self.forms);
        let draft = &mut self.pages[page];
        draft.xobjects.set(form_name.as_bytes().to_vec(), Object::Reference(form_id));
        draft.operations
            .push(Operation::new("Do", vec![Object::Name(form_name.into_bytes())]));
    }

    pub fn add_text(&mut self, page: usize, text: &str, x: f32, y: f32) {
        self.pages[page].operations.extend(text_ops(text, x, y));
    }

    /// Text drawn inside its own `q ... Q` group under graphics state `gs`.
    pub fn add_transparent_text(&mut self, page: usize, gs: &str, text: &str, x: f32, y: f32) {
        let ops = &mut self.pages[page].operations;
        ops.push(Operation::new("q", vec![]));
        ops.push(Operation::new("gs", vec![Object::Name(gs.as_bytes().to_vec())]));
        ops.extend(text_ops(text, x, y));
        ops.push(Operation::new("Q", vec![]));
    }

    /// Append raw content-stream operators to a page.
    pub fn add_operations(&mut self, page: usize, operations: Vec<Operation>) {
        self.pages[page].operations.extend(operations);
    }

    pub fn add_ext_gstate(&mut self, page: usize, name: &str, alpha: f32) {
        let id = self.doc.add_object(dictionary! {
            "Type" => "ExtGState",
            "ca" => real(alpha),
            "CA" => real(alpha),
        });
        self.pages[page]
            .ext_gstates
            .set(name.as_bytes().to_vec(), Object::Reference(id));
    }

    pub fn add_annotation(&mut self, page: usize, subtype: &str, rect: Rect) -> ObjectId {
        let id = self.doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => subtype,
            "Rect" => rect_array(rect),
        });
        self.pages[page].annots.push(Object::Reference(id));
        id
    }

    /// A merged field/widget dictionary registered in the AcroForm.
    pub fn add_widget(&mut self, page: usize, field_type: &str, rect: Rect) -> ObjectId {
        let id = self.doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "FT" => field_type,
            "T" => Object::String(format!("field{}", self.fields.len()).into_bytes(), StringFormat::Literal),
            "Rect" => rect_array(rect),
        });
        self.pages[page].annots.push(Object::Reference(id));
        self.fields.push(Object::Reference(id));
        id
    }

    pub fn build(mut self) -> Document {
        let pages_id = self.doc.new_object_id();
        let font_id = self.doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let media_box = rect_array(self.media_box);

        let mut kids = Vec::new();
        for draft in std::mem::take(&mut self.pages) {
            let content = Content {
                operations: draft.operations,
            }
            .encode()
            .unwrap();
            let content_id = self.doc.add_object(Stream::new(Dictionary::new(), content));

            let mut page = dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "Font" => dictionary! { "F1" => font_id },
                    "XObject" => draft.xobjects,
                    "ExtGState" => draft.ext_gstates,
                },
            };
            if !self.inherit_media_box && !draft.no_media_box {
                page.set("MediaBox", media_box.clone());
            }
            if !draft.annots.is_empty() {
                page.set("Annots", draft.annots);
            }
            kids.push(Object::Reference(self.doc.add_object(page)));
        }

        let mut pages = dictionary! {
            "Type" => "Pages",
            "Count" => Object::Integer(kids.len() as i64),
            "Kids" => kids,
        };
        if self.inherit_media_box {
            pages.set("MediaBox", media_box);
        }
        self.doc.objects.insert(pages_id, Object::Dictionary(pages));

        let mut catalog = dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        };
        if !self.fields.is_empty() {
            catalog.set("AcroForm", dictionary! { "Fields" => std::mem::take(&mut self.fields) });
        }
        let catalog_id = self.doc.add_object(catalog);
        self.doc.trailer.set("Root", catalog_id);
        self.doc
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut doc = self.build();
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }
}

fn draw_ops(name: &str, rect: Rect) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![
                real(rect.width()),
                real(0.0),
                real(0.0),
                real(rect.height()),
                real(rect.x0),
                real(rect.y0),
            ],
        ),
        Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ]
}

fn text_ops(text: &str, x: f32, y: f32) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec![Object::Name(b"F1".to_vec()), real(24.0)]),
        Operation::new("Td", vec![real(x), real(y)]),
        Operation::new(
            "Tj",
            vec![Object::String(text.as_bytes().to_vec(), StringFormat::Literal)],
        ),
        Operation::new("ET", vec![]),
    ]
}
