//! Size-targeted compression driver
//!
//! Runs [`Stage::PIPELINE`] front to back. A stage either produces a
//! result inside the window, which ends the run, or leaves its closest miss
//! in the shared [`SearchState`] for the next stage to beat. A stage that
//! fails is logged and skipped; only an unreadable input is an error.

use crate::error::CompressError;
use crate::extract::{extract_image, ImageAsset};
use crate::options::{CompressOptions, CompressionSetting, TargetWindow};
use crate::replace::{replace_image, substitute_stream, ReplaceOutcome};
use crate::scanner::{document_images, scan_placements, Placement};
use crate::search::{Candidate, FallbackLadder, QualityDimensionSearch, SearchState, Stage};
use crate::transcode::{halving_setting, transcode_asset, ImageOutcome};
use crate::watermark::strip_watermarks;
use lopdf::{Document, ObjectId};
use rayon::prelude::*;
use std::collections::HashMap;

/// Final output of a compression run.
#[derive(Debug, Clone)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    /// Stage whose output was returned
    pub stage: Stage,
    /// Uniform setting behind the output, if one was used
    pub setting: Option<CompressionSetting>,
    /// Search and fallback probes spent
    pub probes: usize,
}

impl Compressed {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn fits(&self, window: TargetWindow) -> bool {
        window.contains(self.len())
    }
}

/// Drives the stage pipeline for one document at a time.
#[derive(Debug, Clone, Default)]
pub struct SizeTargetCompressor {
    options: CompressOptions,
}

impl SizeTargetCompressor {
    pub fn new(options: CompressOptions) -> Self {
        Self { options }
    }

    /// Compress `input` toward `window`.
    ///
    /// Always returns a parseable document unless `input` itself cannot be
    /// parsed. The result may lie outside the window; callers check
    /// [`Compressed::fits`].
    pub fn compress(&self, input: &[u8], window: TargetWindow) -> Result<Compressed, CompressError> {
        let doc = load(input)?;
        log::info!(
            "Compressing {} bytes toward [{}, {}]",
            input.len(),
            window.min,
            window.max
        );

        let mut run = Run {
            options: &self.options,
            input,
            doc,
            stripped: false,
            state: SearchState::new(window),
            naive: None,
            baseline: None,
        };

        for stage in Stage::PIPELINE {
            match run.stage(stage) {
                Ok(StageOutcome::Done(candidate)) => return Ok(run.finish(candidate)),
                Ok(StageOutcome::Continue) => {}
                Err(e) => log::warn!("{} failed, keeping previous best: {}", stage, e),
            }
        }

        let best = match run.state.best() {
            Some(best) => best.clone(),
            None => run.naive.clone().unwrap_or_else(|| Candidate {
                bytes: input.to_vec(),
                stage: Stage::NaiveCompaction,
                setting: None,
            }),
        };
        log::info!("No stage reached the window; returning closest result");
        Ok(run.finish(best))
    }
}

enum StageOutcome {
    Done(Candidate),
    Continue,
}

/// State carried across stages of one run.
struct Run<'a> {
    options: &'a CompressOptions,
    input: &'a [u8],
    doc: Document,
    stripped: bool,
    state: SearchState,
    naive: Option<Candidate>,
    baseline: Option<Baseline>,
}

impl Run<'_> {
    fn stage(&mut self, stage: Stage) -> Result<StageOutcome, CompressError> {
        match stage {
            Stage::WatermarkStrip => {
                if let Some(policy) = &self.options.watermark {
                    let report = strip_watermarks(&mut self.doc, policy);
                    log::info!("{}: {:?}", stage, report);
                    self.stripped = !report.is_empty();
                }
                Ok(StageOutcome::Continue)
            }
            Stage::NaiveCompaction => self.naive_compaction(),
            Stage::Search => {
                let Some(baseline) = &self.baseline else {
                    return Ok(StageOutcome::Continue);
                };
                log::info!("{}", stage);
                let search = QualityDimensionSearch::new(
                    &self.options.quality_ladder,
                    &self.options.dimension_presets,
                );
                Ok(search
                    .run(&mut self.state, |setting| baseline.probe(setting))
                    .map_or(StageOutcome::Continue, StageOutcome::Done))
            }
            Stage::Fallback => {
                let Some(baseline) = &self.baseline else {
                    return Ok(StageOutcome::Continue);
                };
                log::info!("{}", stage);
                Ok(FallbackLadder::new(&self.options.fallback_ladder)
                    .run(&mut self.state, |setting| baseline.probe(setting))
                    .map_or(StageOutcome::Continue, StageOutcome::Done))
            }
            Stage::Forced => {
                if self.baseline.is_none() {
                    return Ok(StageOutcome::Continue);
                }
                log::info!("{}", stage);
                let start = self
                    .state
                    .best()
                    .or(self.naive.as_ref())
                    .map_or(self.input, |c| c.bytes.as_slice());
                let Some(bytes) = forced_pass(start, self.options)? else {
                    return Ok(StageOutcome::Continue);
                };
                log::debug!("Forced pass: {} bytes", bytes.len());
                Ok(self
                    .state
                    .record(Candidate {
                        bytes,
                        stage: Stage::Forced,
                        setting: None,
                    })
                    .map_or(StageOutcome::Continue, StageOutcome::Done))
            }
        }
    }

    fn naive_compaction(&mut self) -> Result<StageOutcome, CompressError> {
        let window = self.state.window();
        let bytes = match serialize(&mut self.doc) {
            // Recompaction never makes an untouched document bigger
            Ok(bytes) if self.stripped || bytes.len() <= self.input.len() => bytes,
            Ok(_) => self.input.to_vec(),
            Err(e) => {
                log::warn!("Recompaction failed, using input as baseline: {}", e);
                self.input.to_vec()
            }
        };
        log::info!("{}: {} bytes", Stage::NaiveCompaction, bytes.len());

        let naive = Candidate {
            bytes,
            stage: Stage::NaiveCompaction,
            setting: None,
        };
        if window.contains(naive.len()) {
            return Ok(StageOutcome::Done(naive));
        }
        if naive.len() < window.min {
            log::info!("Already below the window; images are left alone");
            return Ok(StageOutcome::Done(naive));
        }

        self.naive = Some(naive.clone());
        self.state.record(naive.clone());

        let baseline = Baseline::prepare(&naive.bytes, self.options.min_image_area)?;
        if baseline.assets.is_empty() {
            log::info!("No eligible images; nothing left to degrade");
            return Ok(StageOutcome::Done(naive));
        }
        log::info!("{} eligible images", baseline.assets.len());
        self.baseline = Some(baseline);

        Ok(StageOutcome::Continue)
    }

    fn finish(&self, candidate: Candidate) -> Compressed {
        log::info!(
            "Result: {} bytes from {} after {} probes",
            candidate.len(),
            candidate.stage,
            self.state.probes()
        );
        Compressed {
            bytes: candidate.bytes,
            stage: candidate.stage,
            setting: candidate.setting,
            probes: self.state.probes(),
        }
    }
}

/// Parsed document plus everything probes reuse: decoded images and placements.
struct Baseline {
    doc: Document,
    assets: Vec<ImageAsset>,
    placements: HashMap<ObjectId, Vec<Placement>>,
}

impl Baseline {
    fn prepare(bytes: &[u8], min_area: u64) -> Result<Baseline, CompressError> {
        let doc = load(bytes)?;
        let placements = scan_placements(&doc);
        let assets = extract_all(&doc, min_area);
        Ok(Baseline {
            doc,
            assets,
            placements,
        })
    }

    /// Apply `setting` to every image on a fresh copy and serialize it.
    fn probe(&self, setting: CompressionSetting) -> Result<Vec<u8>, CompressError> {
        let outcomes: Vec<(ObjectId, ImageOutcome)> = self
            .assets
            .par_iter()
            .map(|asset| (asset.id, transcode_asset(asset, setting)))
            .collect();

        let mut doc = self.doc.clone();
        let mut replaced = 0;
        for (id, outcome) in outcomes {
            match outcome {
                ImageOutcome::Transcoded(transcoded) => {
                    let placements = self.placements.get(&id).map_or(&[][..], Vec::as_slice);
                    if let ReplaceOutcome::Replaced { .. } =
                        replace_image(&mut doc, id, &transcoded, placements)
                    {
                        replaced += 1;
                    }
                }
                ImageOutcome::Skipped(reason) => log::debug!("Image {:?} kept: {}", id, reason),
            }
        }
        log::debug!("Replaced {} of {} images", replaced, self.assets.len());

        serialize(&mut doc)
    }
}

fn extract_all(doc: &Document, min_area: u64) -> Vec<ImageAsset> {
    document_images(doc)
        .into_iter()
        .filter_map(|id| match extract_image(doc, id, min_area) {
            Ok(asset) => Some(asset),
            Err(reason) => {
                log::debug!("Image {:?} skipped: {}", id, reason);
                None
            }
        })
        .collect()
}

/// Halve every eligible image at the forced quality, substituting streams in place.
///
/// Returns `None` when no image could be shrunk any further.
pub fn forced_pass(bytes: &[u8], options: &CompressOptions) -> Result<Option<Vec<u8>>, CompressError> {
    let mut doc = load(bytes)?;
    let assets = extract_all(&doc, options.min_image_area);

    let outcomes: Vec<(ObjectId, ImageOutcome)> = assets
        .par_iter()
        .map(|asset| {
            let setting = halving_setting(asset, options.forced_quality);
            (asset.id, transcode_asset(asset, setting))
        })
        .collect();

    let mut substituted = 0;
    for (id, outcome) in outcomes {
        let result = match outcome {
            ImageOutcome::Transcoded(transcoded) => substitute_stream(&mut doc, id, &transcoded),
            ImageOutcome::Skipped(reason) => Err(reason),
        };
        match result {
            Ok(()) => substituted += 1,
            Err(reason) => log::debug!("Image {:?} kept: {}", id, reason),
        }
    }

    if substituted == 0 {
        return Ok(None);
    }
    serialize(&mut doc).map(Some)
}

fn load(bytes: &[u8]) -> Result<Document, CompressError> {
    Document::load_mem(bytes).map_err(|e| CompressError::Load(e.to_string()))
}

/// Drop unreachable objects, Flate-compress plain streams and write out.
fn serialize(doc: &mut Document) -> Result<Vec<u8>, CompressError> {
    doc.prune_objects();
    doc.compress();

    let mut output_bytes = Vec::new();
    doc.save_to(&mut output_bytes)
        .map_err(|e| CompressError::Save(e.to_string()))?;
    Ok(output_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{PdfBuilder, TestImage};
    use crate::scanner::{page_rect, Rect};

    fn photo_pdf() -> Vec<u8> {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let img = builder.add_image(&TestImage::photo_rgb(600, 450, 1));
        builder.place_image(0, img, Rect::new(72.0, 300.0, 540.0, 651.0));
        builder.add_text(0, "Caption", 72.0, 250.0);
        builder.to_bytes()
    }

    fn placement_rects(bytes: &[u8]) -> Vec<(u32, Rect)> {
        let doc = Document::load_mem(bytes).unwrap();
        let mut rects: Vec<(u32, Rect)> = scan_placements(&doc)
            .into_values()
            .flatten()
            .map(|p| (p.page, p.rect))
            .collect();
        rects.sort_by(|a, b| a.1.x0.total_cmp(&b.1.x0));
        rects
    }

    fn compress(bytes: &[u8], window: TargetWindow) -> Compressed {
        SizeTargetCompressor::default().compress(bytes, window).unwrap()
    }

    #[test]
    fn test_unparsable_input_is_a_load_error() {
        let err = SizeTargetCompressor::default()
            .compress(b"not a pdf", TargetWindow::new(1, 2).unwrap())
            .unwrap_err();
        assert!(matches!(err, CompressError::Load(_)));
    }

    #[test]
    fn test_window_containing_naive_result_stops_early() {
        let out = compress(&photo_pdf(), TargetWindow::new(1, usize::MAX).unwrap());
        assert_eq!(out.stage, Stage::NaiveCompaction);
        assert_eq!(out.probes, 0);
    }

    #[test]
    fn test_window_above_document_returns_naive_result() {
        let input = photo_pdf();
        let window = TargetWindow::new(input.len() * 10, input.len() * 20).unwrap();
        let out = compress(&input, window);
        assert_eq!(out.stage, Stage::NaiveCompaction);
        assert!(out.len() <= input.len());
        assert!(!out.fits(window));
    }

    #[test]
    fn test_first_search_probe_in_window_is_returned() {
        let input = photo_pdf();
        let naive = {
            let mut doc = load(&input).unwrap();
            let bytes = serialize(&mut doc).unwrap();
            if bytes.len() <= input.len() {
                bytes
            } else {
                input.clone()
            }
        };
        let baseline = Baseline::prepare(&naive, crate::options::MIN_IMAGE_AREA).unwrap();
        assert_eq!(baseline.assets.len(), 1);

        // The binary search opens at the ladder midpoint, quality 50
        let first = baseline.probe(CompressionSetting::new(50, 800)).unwrap();
        assert!(first.len() < naive.len());

        let window = TargetWindow::new(first.len(), first.len()).unwrap();
        let out = compress(&input, window);
        assert_eq!(out.stage, Stage::Search);
        assert_eq!(out.setting, Some(CompressionSetting::new(50, 800)));
        assert_eq!(out.probes, 1);
        assert_eq!(out.bytes, first);
    }

    #[test]
    fn test_unreachable_window_returns_smallest_result_with_geometry_intact() {
        let input = photo_pdf();
        let window = TargetWindow::new(10, 20).unwrap();
        let out = compress(&input, window);

        assert!(out.len() < input.len());
        assert!(out.probes <= 5 * 5 + 4);

        let doc = Document::load_mem(&out.bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
        let page_id = doc.get_pages()[&1];
        assert_eq!(page_rect(&doc, page_id), Some(Rect::new(0.0, 0.0, 612.0, 792.0)));
        assert_eq!(placement_rects(&out.bytes), placement_rects(&input));
    }

    #[test]
    fn test_text_only_document_skips_image_stages() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        builder.add_text(0, "Just words", 72.0, 700.0);
        let input = builder.to_bytes();

        let out = compress(&input, TargetWindow::new(10, 20).unwrap());
        assert_eq!(out.stage, Stage::NaiveCompaction);
        assert_eq!(out.probes, 0);
        assert!(out.len() <= input.len());
    }

    #[test]
    fn test_forced_pass_halves_images() {
        let input = photo_pdf();
        let options = CompressOptions::default();
        let forced = forced_pass(&input, &options).unwrap().unwrap();
        assert!(forced.len() < input.len());

        let doc = Document::load_mem(&forced).unwrap();
        let id = document_images(&doc)[0];
        let asset = extract_image(&doc, id, 0).unwrap();
        assert_eq!((asset.width, asset.height), (300, 225));
    }

    #[test]
    fn test_forced_pass_on_tiny_images_changes_nothing() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let icon = builder.add_image(&TestImage::noise_rgb(40, 40, 2));
        builder.place_image(0, icon, Rect::new(0.0, 0.0, 40.0, 40.0));
        let input = builder.to_bytes();

        assert_eq!(forced_pass(&input, &CompressOptions::default()).unwrap(), None);
    }

    #[test]
    fn test_watermark_pass_runs_before_compaction() {
        let mut builder = PdfBuilder::new(612.0, 792.0);
        builder.add_annotation(0, "Watermark", Rect::new(200.0, 300.0, 400.0, 500.0));
        builder.add_text(0, "Body", 72.0, 700.0);
        let input = builder.to_bytes();

        let compressor = SizeTargetCompressor::new(CompressOptions::default().with_watermark_stripping());
        let out = compressor
            .compress(&input, TargetWindow::new(1, usize::MAX).unwrap())
            .unwrap();

        let doc = Document::load_mem(&out.bytes).unwrap();
        let page_id = doc.get_pages()[&1];
        assert!(doc.get_dictionary(page_id).unwrap().get(b"Annots").is_err());
    }

    #[test]
    fn test_inverted_image_keeps_its_rendered_colors() {
        let image = TestImage::photo_rgb(400, 300, 4);
        let mut builder = PdfBuilder::new(612.0, 792.0);
        let id = builder.add_image(&image);
        builder.set_image_entry(
            id,
            "Decode",
            lopdf::Object::Array([1, 0, 1, 0, 1, 0].map(lopdf::Object::Integer).to_vec()),
        );
        builder.place_image(0, id, Rect::new(72.0, 300.0, 472.0, 600.0));
        let input = builder.to_bytes();

        let out = compress(&input, TargetWindow::new(10, 20).unwrap());

        let doc = Document::load_mem(&out.bytes).unwrap();
        let rendered = extract_image(&doc, document_images(&doc)[0], 0).unwrap().pixels.to_rgb8();
        let rendered_blue =
            rendered.pixels().map(|p| p[2] as f32).sum::<f32>() / rendered.pixels().len() as f32;
        let expected_blue = image.data.iter().skip(2).step_by(3).map(|&b| (255 - b) as f32).sum::<f32>()
            / (400 * 300) as f32;
        assert!(
            (rendered_blue - expected_blue).abs() < 25.0,
            "blue mean {} vs {}",
            rendered_blue,
            expected_blue
        );
    }

    #[test]
    fn test_unreachable_window_returns_closest_candidate() {
        let input = photo_pdf();
        let options = CompressOptions::default();
        let window = TargetWindow::new(10, 20).unwrap();
        let out = compress(&input, window);

        // Rebuild every candidate the run could have produced
        let naive = {
            let bytes = serialize(&mut load(&input).unwrap()).unwrap();
            if bytes.len() <= input.len() {
                bytes
            } else {
                input.clone()
            }
        };
        let baseline = Baseline::prepare(&naive, options.min_image_area).unwrap();
        let mut candidates = vec![naive];
        for &dimension in &options.dimension_presets {
            for quality in [50, 25, 15, 10, 5] {
                candidates.push(baseline.probe(CompressionSetting::new(quality, dimension)).unwrap());
            }
        }
        for &setting in &options.fallback_ladder {
            candidates.push(baseline.probe(setting).unwrap());
        }
        let closest = candidates.iter().min_by_key(|c| window.distance(c.len())).unwrap();
        if let Some(forced) = forced_pass(closest, &options).unwrap() {
            candidates.push(forced);
        }

        let expected = candidates.iter().map(|c| window.distance(c.len())).min().unwrap();
        assert_eq!(window.distance(out.len()), expected);

        let doc = Document::load_mem(&out.bytes).unwrap();
        for id in document_images(&doc) {
            let asset = extract_image(&doc, id, 0).unwrap();
            assert!(asset.width.max(asset.height) <= 150);
        }
    }
}
