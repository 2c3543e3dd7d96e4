//! Putting re-encoded images back into the document

use crate::error::SkipReason;
use crate::scanner::Placement;
use crate::transcode::Transcoded;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

/// Result of a placement-aware replacement.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    /// The image now lives at `new_id`; `references` entries were redirected.
    Replaced { new_id: ObjectId, references: usize },
    /// The image is never painted; nothing was changed.
    NoPlacements,
}

/// Build a DCTDecode image XObject for a transcoded blob
pub fn image_stream(transcoded: &Transcoded) -> Stream {
    let mut dict = Dictionary::new();
    dict.set("Type", Object::Name(b"XObject".to_vec()));
    dict.set("Subtype", Object::Name(b"Image".to_vec()));
    dict.set("Width", Object::Integer(transcoded.width as i64));
    dict.set("Height", Object::Integer(transcoded.height as i64));
    dict.set("ColorSpace", Object::Name(b"DeviceRGB".to_vec()));
    dict.set("BitsPerComponent", Object::Integer(8));
    dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
    dict.set("Length", Object::Integer(transcoded.data.len() as i64));

    Stream::new(dict, transcoded.data.clone())
}

/// Replace image `id` at every place it is drawn.
///
/// The replacement is added as a new object, every reference to the old image
/// is redirected to it and the old object is removed. Content streams are not
/// touched, so each placement keeps its transform and therefore its rectangle.
pub fn replace_image(
    doc: &mut Document,
    id: ObjectId,
    transcoded: &Transcoded,
    placements: &[Placement],
) -> ReplaceOutcome {
    if placements.is_empty() {
        return ReplaceOutcome::NoPlacements;
    }

    let new_id = doc.add_object(image_stream(transcoded));
    let mut references = 0;
    for (obj_id, object) in doc.objects.iter_mut() {
        if *obj_id != id {
            references += redirect_references(object, id, new_id);
        }
    }
    references += doc
        .trailer
        .iter_mut()
        .map(|(_, value)| redirect_references(value, id, new_id))
        .sum::<usize>();

    doc.objects.remove(&id);

    ReplaceOutcome::Replaced { new_id, references }
}

/// Overwrite the stream stored at `id` in place.
///
/// Used by the forced pass: it needs no placement bookkeeping and cannot fail
/// for an existing image object.
pub fn substitute_stream(
    doc: &mut Document,
    id: ObjectId,
    transcoded: &Transcoded,
) -> Result<(), SkipReason> {
    match doc.objects.get(&id) {
        Some(Object::Stream(_)) => {
            doc.objects.insert(id, Object::Stream(image_stream(transcoded)));
            Ok(())
        }
        _ => Err(SkipReason::Missing(id)),
    }
}

fn redirect_references(object: &mut Object, old: ObjectId, new: ObjectId) -> usize {
    match object {
        Object::Reference(target) if *target == old => {
            *target = new;
            1
        }
        Object::Array(items) => items
            .iter_mut()
            .map(|item| redirect_references(item, old, new))
            .sum(),
        Object::Dictionary(dict) => dict
            .iter_mut()
            .map(|(_, value)| redirect_references(value, old, new))
            .sum(),
        Object::Stream(stream) => stream
            .dict
            .iter_mut()
            .map(|(_, value)| redirect_references(value, old, new))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{PdfBuilder, TestImage};
    use crate::scanner::{scan_placements, Rect};

    fn tiny_jpeg() -> Transcoded {
        let rgb = image::RgbImage::from_pixel(8, 6, image::Rgb([200, 10, 10]));
        Transcoded {
            data: crate::transcode::encode_jpeg(&rgb, 50).unwrap(),
            width: 8,
            height: 6,
        }
    }

    #[test]
    fn test_replacement_keeps_every_rectangle() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let img = builder.add_image(&TestImage::noise_rgba(100, 100, 7));
        builder.place_image(0, img, Rect::new(50.0, 50.0, 150.0, 150.0));
        builder.place_image_in_form(0, img, Rect::new(300.0, 300.0, 500.0, 400.0));
        let mut doc = builder.build();

        let before = scan_placements(&doc);
        let outcome = replace_image(&mut doc, img, &tiny_jpeg(), &before[&img]);
        let ReplaceOutcome::Replaced { new_id, references } = outcome else {
            panic!("expected replacement, got {:?}", outcome);
        };
        assert!(references >= 2);
        assert!(doc.get_object(img).is_err());

        let after = scan_placements(&doc);
        assert_eq!(after[&new_id], before[&img]);
        match doc.get_object(new_id) {
            Ok(Object::Stream(s)) => {
                assert_eq!(s.dict.get(b"Filter").unwrap().as_name().unwrap(), b"DCTDecode");
                assert!(s.dict.get(b"SMask").is_err());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unplaced_image_is_left_alone() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let img = builder.add_image(&TestImage::noise_rgb(100, 100, 8));
        let mut doc = builder.build();

        let outcome = replace_image(&mut doc, img, &tiny_jpeg(), &[]);
        assert_eq!(outcome, ReplaceOutcome::NoPlacements);
        assert!(doc.get_object(img).is_ok());
    }

    #[test]
    fn test_substitution_keeps_the_object_id() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let img = builder.add_image(&TestImage::noise_rgb(100, 100, 9));
        builder.place_image(0, img, Rect::new(0.0, 0.0, 10.0, 10.0));
        let mut doc = builder.build();

        substitute_stream(&mut doc, img, &tiny_jpeg()).unwrap();
        let stream = doc.get_object(img).unwrap().as_stream().unwrap();
        assert_eq!(stream.dict.get(b"Width").unwrap().as_i64().unwrap(), 8);
        assert_eq!(scan_placements(&doc)[&img].len(), 1);

        assert_eq!(
            substitute_stream(&mut doc, (9999, 0), &tiny_jpeg()),
            Err(SkipReason::Missing((9999, 0)))
        );
    }
}
