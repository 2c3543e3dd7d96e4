//! Watermark stripping pre-pass
//!
//! Only the central region of each page is considered; an outer margin (20%
//! per side by default) is treated as header/footer space and never touched.
//! Inside that region the pass removes:
//!
//! - annotations of the configured subtypes (`Watermark`, `Stamp`)
//! - text and button form-field widgets
//! - draws of small or transparent images
//! - top-level `q ... Q` groups that switch to a transparent graphics state
//!   and only draw inside the region
//!
//! Every failure is contained to its page; the pass never aborts.

use crate::scanner::{
    get_page_resources, image_dimensions, name_operand, page_operations, page_rect,
    resource_entries, resolve, Matrix, Rect,
};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{BTreeSet, HashMap};

/// Policy for what counts as a watermark.
#[derive(Debug, Clone)]
pub struct WatermarkPolicy {
    /// Fraction of width/height kept clear on every side
    pub margin: f32,
    /// Annotation subtypes removed from the central region
    pub annotation_subtypes: Vec<Vec<u8>>,
    /// Images with fewer pixels than this are removed from the central region
    pub small_image_pixels: u64,
    /// Remove images carrying a soft mask or color-key mask
    pub strip_transparent_images: bool,
    /// Graphics states with constant alpha below this are transparent
    pub transparent_group_alpha: f32,
    /// Remove `Tx` / `Btn` form-field widgets
    pub strip_form_fields: bool,
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self {
            margin: 0.2,
            annotation_subtypes: vec![b"Watermark".to_vec(), b"Stamp".to_vec()],
            small_image_pixels: 20_000,
            strip_transparent_images: true,
            transparent_group_alpha: 1.0,
            strip_form_fields: true,
        }
    }
}

/// What the pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripReport {
    pub annotations: usize,
    pub form_fields: usize,
    pub image_draws: usize,
    pub groups: usize,
    pub failed_pages: usize,
}

impl StripReport {
    pub fn is_empty(&self) -> bool {
        self.annotations + self.form_fields + self.image_draws + self.groups == 0
    }
}

/// Strip watermark-like content from every page, best-effort.
pub fn strip_watermarks(doc: &mut Document, policy: &WatermarkPolicy) -> StripReport {
    let mut report = StripReport::default();
    let mut removed_widgets = BTreeSet::new();

    for (page_num, page_id) in doc.get_pages() {
        if let Err(e) = strip_page(doc, page_id, policy, &mut report, &mut removed_widgets) {
            log::warn!("Watermark pass skipped page {}: {}", page_num, e);
            report.failed_pages += 1;
        }
    }

    if !removed_widgets.is_empty() {
        if let Err(e) = drop_form_fields(doc, &removed_widgets) {
            log::warn!("Could not update AcroForm fields: {}", e);
        }
    }

    log::debug!("Watermark pass: {:?}", report);
    report
}

fn strip_page(
    doc: &mut Document,
    page_id: ObjectId,
    policy: &WatermarkPolicy,
    report: &mut StripReport,
    removed_widgets: &mut BTreeSet<ObjectId>,
) -> Result<(), String> {
    let central = page_rect(doc, page_id)
        .ok_or("page has no MediaBox")?
        .interior(policy.margin);

    strip_annotations(doc, page_id, &central, policy, report, removed_widgets)?;

    let operations = page_operations(doc, page_id);
    if operations.is_empty() {
        return Ok(());
    }

    let removals = OperatorFilter::new(doc, page_id, central, policy).run(&operations, report);
    if removals.is_empty() {
        return Ok(());
    }

    let kept: Vec<Operation> = operations
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !removals.contains(i))
        .map(|(_, op)| op)
        .collect();
    let bytes = Content { operations: kept }
        .encode()
        .map_err(|e| format!("could not encode content: {}", e))?;

    let content_id = doc.add_object(Stream::new(Dictionary::new(), bytes));
    doc.get_dictionary_mut(page_id)
        .map_err(|e| e.to_string())?
        .set("Contents", Object::Reference(content_id));

    Ok(())
}

fn strip_annotations(
    doc: &mut Document,
    page_id: ObjectId,
    central: &Rect,
    policy: &WatermarkPolicy,
    report: &mut StripReport,
    removed_widgets: &mut BTreeSet<ObjectId>,
) -> Result<(), String> {
    let annots: Vec<Object> = match doc.get_dictionary(page_id).map_err(|e| e.to_string())?.get(b"Annots") {
        Ok(Object::Array(arr)) => arr.clone(),
        Ok(Object::Reference(id)) => doc
            .get_object(*id)
            .and_then(Object::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => return Ok(()),
    };

    let mut kept = Vec::with_capacity(annots.len());
    for annot in annots {
        let dict = match &annot {
            Object::Reference(id) => doc.get_dictionary(*id).ok(),
            Object::Dictionary(d) => Some(d),
            _ => None,
        };
        let Some(dict) = dict else {
            kept.push(annot);
            continue;
        };

        let inside = dict
            .get(b"Rect")
            .ok()
            .and_then(|r| resolve(doc, r))
            .and_then(Rect::from_object)
            .is_some_and(|r| central.contains(&r));
        let subtype = dict.get(b"Subtype").and_then(Object::as_name).unwrap_or_default();

        if inside && policy.annotation_subtypes.iter().any(|s| s.as_slice() == subtype) {
            report.annotations += 1;
        } else if inside
            && policy.strip_form_fields
            && subtype == b"Widget"
            && matches!(field_type(doc, dict).as_deref(), Some(b"Tx") | Some(b"Btn"))
        {
            report.form_fields += 1;
            if let Object::Reference(id) = &annot {
                removed_widgets.insert(*id);
            }
        } else {
            kept.push(annot);
        }
    }

    let page = doc.get_dictionary_mut(page_id).map_err(|e| e.to_string())?;
    if kept.is_empty() {
        page.remove(b"Annots");
    } else {
        page.set("Annots", Object::Array(kept));
    }
    Ok(())
}

/// `FT` of a widget, inherited from parent fields if necessary.
fn field_type(doc: &Document, dict: &Dictionary) -> Option<Vec<u8>> {
    let mut current = dict;
    for _ in 0..32 {
        if let Ok(ft) = current.get(b"FT").and_then(Object::as_name) {
            return Some(ft.to_vec());
        }
        let parent = current.get(b"Parent").and_then(Object::as_reference).ok()?;
        current = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn drop_form_fields(doc: &mut Document, removed: &BTreeSet<ObjectId>) -> Result<(), String> {
    let retain = |arr: &mut Vec<Object>| {
        arr.retain(|item| !matches!(item, Object::Reference(id) if removed.contains(id)));
    };

    let root_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(|e| e.to_string())?;
    let acro_form = doc
        .get_dictionary(root_id)
        .map_err(|e| e.to_string())?
        .get(b"AcroForm")
        .ok()
        .cloned();

    let (holder, fields) = match acro_form {
        Some(Object::Reference(acro_id)) => (
            Some(acro_id),
            doc.get_dictionary(acro_id)
                .ok()
                .and_then(|d| d.get(b"Fields").ok().cloned()),
        ),
        Some(Object::Dictionary(d)) => (None, d.get(b"Fields").ok().cloned()),
        _ => return Ok(()),
    };

    match fields {
        Some(Object::Reference(fields_id)) => {
            if let Ok(Object::Array(arr)) = doc.get_object_mut(fields_id) {
                retain(arr);
            }
        }
        Some(Object::Array(_)) => {
            let acro = match holder {
                Some(acro_id) => doc.get_dictionary_mut(acro_id),
                None => doc
                    .get_dictionary_mut(root_id)
                    .and_then(|catalog| catalog.get_mut(b"AcroForm"))
                    .and_then(Object::as_dict_mut),
            }
            .map_err(|e| e.to_string())?;
            if let Ok(Object::Array(arr)) = acro.get_mut(b"Fields") {
                retain(arr);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Bookkeeping for one top-level `q ... Q` group.
struct Group {
    start: usize,
    transparent: bool,
    inside: usize,
    outside: usize,
}

/// Walks page operators tracking the CTM and text matrix, and picks the
/// operator indexes to drop.
struct OperatorFilter<'a> {
    doc: &'a Document,
    central: Rect,
    policy: &'a WatermarkPolicy,
    xobjects: HashMap<Vec<u8>, ObjectId>,
    gstates: HashMap<Vec<u8>, ObjectId>,
    group: Option<Group>,
}

impl<'a> OperatorFilter<'a> {
    fn new(doc: &'a Document, page_id: ObjectId, central: Rect, policy: &'a WatermarkPolicy) -> Self {
        let resources = get_page_resources(doc, page_id);
        OperatorFilter {
            doc,
            central,
            policy,
            xobjects: resource_entries(doc, &resources, b"XObject"),
            gstates: resource_entries(doc, &resources, b"ExtGState"),
            group: None,
        }
    }

    fn run(mut self, operations: &[Operation], report: &mut StripReport) -> BTreeSet<usize> {
        let mut removals = BTreeSet::new();
        let mut ctm_stack = vec![Matrix::identity()];
        let mut depth = 0usize;
        let mut text_matrix = Matrix::identity();
        let mut line_matrix = Matrix::identity();

        for (i, op) in operations.iter().enumerate() {
            let ctm = ctm_stack.last().copied().unwrap_or(Matrix::identity());
            let operands = &op.operands;

            match op.operator.as_str() {
                "q" => {
                    if depth == 0 {
                        self.group = Some(Group {
                            start: i,
                            transparent: false,
                            inside: 0,
                            outside: 0,
                        });
                    }
                    depth += 1;
                    ctm_stack.push(ctm);
                }
                "Q" => {
                    if ctm_stack.len() > 1 {
                        ctm_stack.pop();
                    }
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if let Some(group) = self.group.take() {
                            if group.transparent && group.inside > 0 && group.outside == 0 {
                                removals.extend(group.start..=i);
                                report.groups += 1;
                            }
                        }
                    }
                }
                "cm" => {
                    if let (Some(m), Some(current)) =
                        (Matrix::from_operands(operands), ctm_stack.last_mut())
                    {
                        *current = m.concat(current);
                    }
                }
                "gs" => {
                    let transparent = name_operand(op)
                        .and_then(|n| self.gstates.get(n))
                        .is_some_and(|id| self.is_transparent_gstate(*id));
                    if let (true, Some(group)) = (transparent, self.group.as_mut()) {
                        group.transparent = true;
                    }
                }
                "BT" => {
                    text_matrix = Matrix::identity();
                    line_matrix = Matrix::identity();
                }
                "Tm" => {
                    if let Some(m) = Matrix::from_operands(operands) {
                        text_matrix = m;
                        line_matrix = m;
                    }
                }
                "Td" | "TD" => {
                    if let Some((tx, ty)) = point_operands(operands) {
                        line_matrix = Matrix::translate(tx, ty).concat(&line_matrix);
                        text_matrix = line_matrix;
                    }
                }
                "Tj" | "TJ" | "'" | "\"" => {
                    let (x, y) = text_matrix.concat(&ctm).apply(0.0, 0.0);
                    self.classify(self.central.contains_point(x, y));
                }
                "re" => {
                    if operands.len() >= 4 {
                        let n: Option<Vec<f32>> =
                            operands[..4].iter().map(|o| o.as_float().ok()).collect();
                        if let Some(n) = n {
                            let rect = ctm.transform_rect(&Rect::new(n[0], n[1], n[0] + n[2], n[1] + n[3]));
                            self.classify(self.central.contains(&rect));
                        }
                    }
                }
                // Every endpoint and control point of a path segment
                "m" | "l" | "c" | "v" | "y" => match path_points(operands) {
                    Some(points) => {
                        for (x, y) in points {
                            let (x, y) = ctm.apply(x, y);
                            self.classify(self.central.contains_point(x, y));
                        }
                    }
                    None => self.classify(false),
                },
                "BI" => self.classify(self.central.contains(&ctm.unit_square())),
                // Shadings fill the clip region, which is not tracked
                "sh" => self.classify(false),
                "Do" => {
                    let Some(&obj_id) = name_operand(op).and_then(|n| self.xobjects.get(n)) else {
                        self.classify(false);
                        continue;
                    };
                    let Ok(Object::Stream(stream)) = self.doc.get_object(obj_id) else {
                        self.classify(false);
                        continue;
                    };
                    match stream.dict.get(b"Subtype").and_then(Object::as_name) {
                        Ok(b"Image") => {
                            let rect = ctm.unit_square();
                            let inside = self.central.contains(&rect);
                            self.classify(inside);
                            if inside && self.is_watermark_image(&stream.dict) {
                                removals.insert(i);
                                report.image_draws += 1;
                            }
                        }
                        Ok(b"Form") => {
                            let form_matrix = stream
                                .dict
                                .get(b"Matrix")
                                .ok()
                                .and_then(|m| m.as_array().ok())
                                .and_then(|arr| Matrix::from_operands(arr))
                                .unwrap_or(Matrix::identity());
                            let bbox = stream
                                .dict
                                .get(b"BBox")
                                .ok()
                                .and_then(Rect::from_object)
                                .unwrap_or(Rect::new(0.0, 0.0, 1.0, 1.0));
                            let rect = form_matrix.concat(&ctm).transform_rect(&bbox);
                            self.classify(self.central.contains(&rect));
                        }
                        _ => self.classify(false),
                    }
                }
                _ => {}
            }
        }

        removals
    }

    fn classify(&mut self, inside: bool) {
        if let Some(group) = self.group.as_mut() {
            if inside {
                group.inside += 1;
            } else {
                group.outside += 1;
            }
        }
    }

    fn is_transparent_gstate(&self, id: ObjectId) -> bool {
        let Ok(dict) = self.doc.get_dictionary(id) else {
            return false;
        };
        let low_alpha = [b"ca".as_slice(), b"CA".as_slice()].iter().any(|key| {
            dict.get(key)
                .and_then(Object::as_float)
                .is_ok_and(|alpha| alpha < self.policy.transparent_group_alpha)
        });
        let soft_mask = dict
            .get(b"SMask")
            .is_ok_and(|m| !matches!(m, Object::Name(n) if n == b"None"));
        low_alpha || soft_mask
    }

    fn is_watermark_image(&self, dict: &Dictionary) -> bool {
        let small = image_dimensions(dict)
            .is_some_and(|(w, h)| (w as u64) * (h as u64) < self.policy.small_image_pixels);
        let transparent = dict.has(b"SMask") || dict.has(b"Mask");
        small || (self.policy.strip_transparent_images && transparent)
    }
}

fn point_operands(operands: &[Object]) -> Option<(f32, f32)> {
    match operands {
        [x, y, ..] => Some((x.as_float().ok()?, y.as_float().ok()?)),
        _ => None,
    }
}

/// Coordinate pairs of a path operator; `None` if any operand is not a number.
fn path_points(operands: &[Object]) -> Option<Vec<(f32, f32)>> {
    if operands.len() < 2 || operands.len() % 2 != 0 {
        return None;
    }
    operands
        .chunks_exact(2)
        .map(|pair| Some((pair[0].as_float().ok()?, pair[1].as_float().ok()?)))
        .collect()
}
