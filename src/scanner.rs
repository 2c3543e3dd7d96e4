//! Content-stream scanning
//!
//! Walks page content streams (and the Form XObjects they invoke) with a
//! graphics-state matrix stack, recording the page-space rectangle every image
//! XObject is painted into. The same helpers resolve page geometry and
//! resource dictionaries for the replacement and watermark passes.

use flate2::read::ZlibDecoder;
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;

/// 2D transformation matrix [a, b, c, d, e, f]
/// Represents: | a b 0 |
///             | c d 0 |
///             | e f 1 |
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Matrix {
    pub fn identity() -> Self {
        Matrix {
            a: 1.0,
            b: 0.0,
            c: 0.0,
            d: 1.0,
            e: 0.0,
            f: 0.0,
        }
    }

    pub fn translate(tx: f32, ty: f32) -> Self {
        Matrix {
            e: tx,
            f: ty,
            ..Matrix::identity()
        }
    }

    /// Concatenate another matrix: self * other
    pub fn concat(&self, other: &Matrix) -> Matrix {
        Matrix {
            a: self.a * other.a + self.b * other.c,
            b: self.a * other.b + self.b * other.d,
            c: self.c * other.a + self.d * other.c,
            d: self.c * other.b + self.d * other.d,
            e: self.e * other.a + self.f * other.c + other.e,
            f: self.e * other.b + self.f * other.d + other.f,
        }
    }

    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    /// Bounding box of the unit square under this matrix (where an image lands).
    pub fn unit_square(&self) -> Rect {
        self.transform_rect(&Rect::new(0.0, 0.0, 1.0, 1.0))
    }

    /// Axis-aligned bounding box of a transformed rectangle.
    pub fn transform_rect(&self, rect: &Rect) -> Rect {
        let corners = [
            self.apply(rect.x0, rect.y0),
            self.apply(rect.x1, rect.y0),
            self.apply(rect.x0, rect.y1),
            self.apply(rect.x1, rect.y1),
        ];
        let mut out = Rect::new(corners[0].0, corners[0].1, corners[0].0, corners[0].1);
        for (x, y) in &corners[1..] {
            out.x0 = out.x0.min(*x);
            out.y0 = out.y0.min(*y);
            out.x1 = out.x1.max(*x);
            out.y1 = out.y1.max(*y);
        }
        out
    }

    /// Parse the six operands of a `cm` / `Tm` operation.
    pub fn from_operands(operands: &[Object]) -> Option<Matrix> {
        if operands.len() < 6 {
            return None;
        }
        let n: Vec<f32> = operands[..6]
            .iter()
            .map(|o| o.as_float().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Matrix {
            a: n[0],
            b: n[1],
            c: n[2],
            d: n[3],
            e: n[4],
            f: n[5],
        })
    }
}

/// Axis-aligned rectangle in PDF user space, normalized so `x0 <= x1`, `y0 <= y1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Rect {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x0 >= self.x0 && other.x1 <= self.x1 && other.y0 >= self.y0 && other.y1 <= self.y1
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        x >= self.x0 && x <= self.x1 && y >= self.y0 && y <= self.y1
    }

    /// The rectangle left after trimming `margin` (a fraction) from every side.
    pub fn interior(&self, margin: f32) -> Rect {
        let dx = self.width() * margin;
        let dy = self.height() * margin;
        Rect::new(self.x0 + dx, self.y0 + dy, self.x1 - dx, self.y1 - dy)
    }

    /// Parse a `[x0 y0 x1 y1]` array.
    pub fn from_object(obj: &Object) -> Option<Rect> {
        let arr = obj.as_array().ok()?;
        if arr.len() < 4 {
            return None;
        }
        let n: Vec<f32> = arr[..4]
            .iter()
            .map(|o| o.as_float().ok())
            .collect::<Option<Vec<_>>>()?;
        Some(Rect::new(n[0], n[1], n[2], n[3]))
    }
}

/// Where an image is painted: page number (1-based) and page-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub page: u32,
    pub rect: Rect,
}

/// Decompress a stream's content
pub fn decompress_stream(stream: &Stream) -> Vec<u8> {
    if let Ok(content) = stream.decompressed_content() {
        return content;
    }

    let filter = stream.dict.get(b"Filter").ok().and_then(|f| match f {
        Object::Name(n) => Some(vec![n.clone()]),
        Object::Array(arr) => Some(
            arr.iter()
                .filter_map(|f| match f {
                    Object::Name(n) => Some(n.clone()),
                    _ => None,
                })
                .collect(),
        ),
        _ => None,
    });

    let mut data = stream.content.clone();

    if let Some(filters) = filter {
        for filter_name in filters {
            if filter_name != b"FlateDecode" {
                // Unknown filter, return as-is
                return data;
            }
            let mut decoder = ZlibDecoder::new(&data[..]);
            let mut decoded = Vec::new();
            if decoder.read_to_end(&mut decoded).is_err() {
                return stream.content.clone();
            }
            data = decoded;
        }
    }

    data
}

/// Follow a reference to the object it names.
pub fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        _ => Some(obj),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(d) => Some(d),
        Object::Stream(s) => Some(&s.dict),
        _ => None,
    }
}

/// Look up a page attribute, walking up the page tree for inherited ones.
pub fn inherited_attribute(doc: &Document, page_id: ObjectId, key: &[u8]) -> Option<Object> {
    let mut current = Some(page_id);
    let mut depth = 0;
    while let Some(id) = current {
        let dict = doc.get_dictionary(id).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some(value.clone());
        }
        current = dict.get(b"Parent").and_then(Object::as_reference).ok();
        depth += 1;
        if depth > 64 {
            break;
        }
    }
    None
}

/// Resources for a page, checking parent pages if needed
pub fn get_page_resources(doc: &Document, page_id: ObjectId) -> Object {
    inherited_attribute(doc, page_id, b"Resources").unwrap_or(Object::Null)
}

/// The page's MediaBox (inherited if necessary).
pub fn page_rect(doc: &Document, page_id: ObjectId) -> Option<Rect> {
    let media_box = inherited_attribute(doc, page_id, b"MediaBox")?;
    Rect::from_object(resolve(doc, &media_box)?)
}

/// Name -> object ID entries of one resource category (`XObject`, `ExtGState`, ...).
pub fn resource_entries(
    doc: &Document,
    resources: &Object,
    category: &[u8],
) -> HashMap<Vec<u8>, ObjectId> {
    let mut result = HashMap::new();

    let entries = resolve_dict(doc, resources)
        .and_then(|res| res.get(category).ok())
        .and_then(|cat| resolve_dict(doc, cat));

    if let Some(entries) = entries {
        for (name, value) in entries.iter() {
            if let Object::Reference(obj_id) = value {
                result.insert(name.clone(), *obj_id);
            }
        }
    }

    result
}

/// Subtype of an XObject stream, if the ID names one.
pub fn xobject_subtype(doc: &Document, id: ObjectId) -> Option<Vec<u8>> {
    match doc.get_object(id) {
        Ok(Object::Stream(stream)) => stream
            .dict
            .get(b"Subtype")
            .and_then(Object::as_name)
            .ok()
            .map(|n| n.to_vec()),
        _ => None,
    }
}

/// Integer `Width` / `Height` of an image dictionary.
pub fn image_dimensions(dict: &Dictionary) -> Option<(u32, u32)> {
    let get = |key: &[u8]| -> Option<u32> {
        match dict.get(key).ok()? {
            Object::Integer(n) if *n > 0 => u32::try_from(*n).ok(),
            Object::Real(n) if *n > 0.0 => Some(*n as u32),
            _ => None,
        }
    };
    Some((get(b"Width")?, get(b"Height")?))
}

/// Decoded operations of a page's content streams; empty when undecodable.
pub fn page_operations(doc: &Document, page_id: ObjectId) -> Vec<Operation> {
    doc.get_page_content(page_id)
        .ok()
        .and_then(|data| Content::decode(&data).ok())
        .map(|content| content.operations)
        .unwrap_or_default()
}

/// Operand name of a `Do` / `gs` operation.
pub fn name_operand(op: &Operation) -> Option<&[u8]> {
    op.operands.first().and_then(|o| o.as_name().ok())
}

/// Context for scanning content streams
pub struct ContentScanner<'a> {
    doc: &'a Document,
    /// Map from image object ID to its placements (an image may appear multiple times)
    placements: HashMap<ObjectId, Vec<Placement>>,
    /// Forms currently being scanned (guards against cycles, not repeats)
    form_stack: Vec<ObjectId>,
}

impl<'a> ContentScanner<'a> {
    pub fn new(doc: &'a Document) -> Self {
        ContentScanner {
            doc,
            placements: HashMap::new(),
            form_stack: Vec::new(),
        }
    }

    /// Scan all pages in the document
    pub fn scan_all_pages(mut self) -> HashMap<ObjectId, Vec<Placement>> {
        for (page_num, page_id) in self.doc.get_pages() {
            let resources = get_page_resources(self.doc, page_id);
            let operations = page_operations(self.doc, page_id);
            self.scan_operations(page_num, &operations, &resources, Matrix::identity());
        }
        self.placements
    }

    fn scan_operations(
        &mut self,
        page: u32,
        operations: &[Operation],
        resources: &Object,
        initial_matrix: Matrix,
    ) {
        let xobjects = resource_entries(self.doc, resources, b"XObject");

        // Graphics state stack
        let mut matrix_stack: Vec<Matrix> = vec![initial_matrix];

        for op in operations {
            match op.operator.as_str() {
                "q" => {
                    if let Some(current) = matrix_stack.last() {
                        matrix_stack.push(*current);
                    }
                }
                "Q" => {
                    if matrix_stack.len() > 1 {
                        matrix_stack.pop();
                    }
                }
                "cm" => {
                    if let Some(m) = Matrix::from_operands(&op.operands) {
                        if let Some(current) = matrix_stack.last_mut() {
                            *current = m.concat(current);
                        }
                    }
                }
                "Do" => {
                    let Some(&obj_id) = name_operand(op).and_then(|n| xobjects.get(n)) else {
                        continue;
                    };
                    let current_matrix = matrix_stack.last().copied().unwrap_or(Matrix::identity());

                    match xobject_subtype(self.doc, obj_id).as_deref() {
                        Some(b"Image") => {
                            self.placements.entry(obj_id).or_default().push(Placement {
                                page,
                                rect: current_matrix.unit_square(),
                            });
                        }
                        Some(b"Form") => {
                            self.scan_form_xobject(page, obj_id, resources, current_matrix);
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    }

    /// Scan a Form XObject's content stream
    fn scan_form_xobject(
        &mut self,
        page: u32,
        form_id: ObjectId,
        parent_resources: &Object,
        parent_matrix: Matrix,
    ) {
        if self.form_stack.contains(&form_id) {
            return;
        }

        let stream = match self.doc.get_object(form_id) {
            Ok(Object::Stream(s)) => s,
            _ => return,
        };

        let form_matrix = stream
            .dict
            .get(b"Matrix")
            .ok()
            .and_then(|m| m.as_array().ok())
            .and_then(|arr| Matrix::from_operands(arr))
            .unwrap_or(Matrix::identity());

        // Form space maps through its /Matrix, then the invoking CTM
        let combined_matrix = form_matrix.concat(&parent_matrix);

        let resources = stream
            .dict
            .get(b"Resources")
            .cloned()
            .unwrap_or_else(|_| parent_resources.clone());

        let content = decompress_stream(stream);
        let operations = match Content::decode(&content) {
            Ok(c) => c.operations,
            Err(e) => {
                log::debug!("Form {:?}: undecodable content: {}", form_id, e);
                return;
            }
        };

        self.form_stack.push(form_id);
        self.scan_operations(page, &operations, &resources, combined_matrix);
        self.form_stack.pop();
    }
}

/// Image placements across the whole document.
pub fn scan_placements(doc: &Document) -> HashMap<ObjectId, Vec<Placement>> {
    ContentScanner::new(doc).scan_all_pages()
}

/// Collect all image object IDs referenced from a page
pub fn collect_page_images(doc: &Document, page_id: ObjectId) -> Vec<ObjectId> {
    let mut images = Vec::new();
    let mut seen = BTreeSet::new();

    let resources = get_page_resources(doc, page_id);
    let mut xobjects: Vec<ObjectId> = resource_entries(doc, &resources, b"XObject")
        .into_values()
        .collect();
    xobjects.sort();

    for obj_id in xobjects {
        collect_images_recursive(doc, obj_id, &mut images, &mut seen);
    }

    images
}

/// Recursively collect images from an object (handles Form XObjects)
fn collect_images_recursive(
    doc: &Document,
    obj_id: ObjectId,
    images: &mut Vec<ObjectId>,
    seen: &mut BTreeSet<ObjectId>,
) {
    if !seen.insert(obj_id) {
        return;
    }

    let stream = match doc.get_object(obj_id) {
        Ok(Object::Stream(s)) => s,
        _ => return,
    };

    match stream.dict.get(b"Subtype").and_then(Object::as_name) {
        Ok(b"Image") => images.push(obj_id),
        Ok(b"Form") => {
            if let Ok(res) = stream.dict.get(b"Resources") {
                let mut children: Vec<ObjectId> =
                    resource_entries(doc, res, b"XObject").into_values().collect();
                children.sort();
                for child_id in children {
                    collect_images_recursive(doc, child_id, images, seen);
                }
            }
        }
        _ => {}
    }
}

/// Every image reachable from any page, in ascending object-ID order.
pub fn document_images(doc: &Document) -> Vec<ObjectId> {
    let mut all = BTreeSet::new();
    for (_, page_id) in doc.get_pages() {
        all.extend(collect_page_images(doc, page_id));
    }
    all.into_iter().collect()
}
