//! Quality/dimension search and the fallback ladder
//!
//! Both walk [`CompressionSetting`]s and hand each one to a probe function
//! that returns the serialized document for that setting. Neither knows how
//! a probe is carried out, which keeps the control flow testable on its own.

use crate::error::CompressError;
use crate::options::{CompressionSetting, TargetWindow};
use std::collections::HashMap;
use std::fmt;

/// Pipeline stages, in the order the compressor runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WatermarkStrip,
    NaiveCompaction,
    Search,
    Fallback,
    Forced,
}

impl Stage {
    pub const PIPELINE: [Stage; 5] = [
        Stage::WatermarkStrip,
        Stage::NaiveCompaction,
        Stage::Search,
        Stage::Fallback,
        Stage::Forced,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::WatermarkStrip => "watermark strip",
            Stage::NaiveCompaction => "naive compaction",
            Stage::Search => "quality/dimension search",
            Stage::Fallback => "fallback ladder",
            Stage::Forced => "forced pass",
        };
        f.write_str(name)
    }
}

/// A serialized document, the stage that produced it and the uniform
/// setting applied (`None` when images were left alone or set per image).
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bytes: Vec<u8>,
    pub stage: Stage,
    pub setting: Option<CompressionSetting>,
}

impl Candidate {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Best result seen so far; its distance to the window midpoint never grows.
///
/// Also remembers the outcome of every setting already probed, so a later
/// stage asking for the same setting gets the known size instead of a rerun.
#[derive(Debug)]
pub struct SearchState {
    window: TargetWindow,
    best: Option<Candidate>,
    best_distance: usize,
    probes: usize,
    tried: HashMap<CompressionSetting, Option<usize>>,
}

impl SearchState {
    pub fn new(window: TargetWindow) -> Self {
        Self {
            window,
            best: None,
            best_distance: usize::MAX,
            probes: 0,
            tried: HashMap::new(),
        }
    }

    pub fn window(&self) -> TargetWindow {
        self.window
    }

    /// Record a candidate. Returns it back if it lands inside the window.
    pub fn record(&mut self, candidate: Candidate) -> Option<Candidate> {
        let size = candidate.len();
        if self.window.contains(size) {
            return Some(candidate);
        }
        let distance = self.window.distance(size);
        if distance < self.best_distance {
            self.best_distance = distance;
            self.best = Some(candidate);
        }
        None
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    fn probe<F>(&mut self, stage: Stage, setting: CompressionSetting, probe: &mut F) -> ProbeStep
    where
        F: FnMut(CompressionSetting) -> Result<Vec<u8>, CompressError>,
    {
        if let Some(&known) = self.tried.get(&setting) {
            log::debug!(
                "Probe q={} max_dim={} already done, reusing its outcome",
                setting.quality,
                setting.max_dimension
            );
            return known.map_or(ProbeStep::Failed, ProbeStep::Miss);
        }

        self.probes += 1;
        let outcome = probe(setting);
        self.tried.insert(setting, outcome.as_ref().ok().map(Vec::len));
        match outcome {
            Ok(bytes) => {
                let size = bytes.len();
                log::debug!(
                    "Probe q={} max_dim={}: {} bytes",
                    setting.quality,
                    setting.max_dimension,
                    size
                );
                match self.record(Candidate {
                    bytes,
                    stage,
                    setting: Some(setting),
                }) {
                    Some(fit) => ProbeStep::Fit(fit),
                    None => ProbeStep::Miss(size),
                }
            }
            Err(e) => {
                log::warn!(
                    "Probe q={} max_dim={} failed: {}",
                    setting.quality,
                    setting.max_dimension,
                    e
                );
                ProbeStep::Failed
            }
        }
    }
}

enum ProbeStep {
    Fit(Candidate),
    Miss(usize),
    Failed,
}

/// Most probes a binary search over `levels` qualities can take: ceil(log2(levels + 1)).
pub fn max_probes_per_preset(levels: usize) -> usize {
    (usize::BITS - levels.leading_zeros()) as usize
}

/// Binary search over a quality ladder for each dimension preset.
#[derive(Debug, Clone, Copy)]
pub struct QualityDimensionSearch<'a> {
    pub quality_ladder: &'a [u8],
    pub dimension_presets: &'a [u32],
}

impl<'a> QualityDimensionSearch<'a> {
    pub fn new(quality_ladder: &'a [u8], dimension_presets: &'a [u32]) -> Self {
        Self {
            quality_ladder,
            dimension_presets,
        }
    }

    /// Run until the first probe lands inside the window.
    ///
    /// Returns that candidate, or `None` with the closest miss kept in `state`.
    pub fn run<F>(&self, state: &mut SearchState, mut probe: F) -> Option<Candidate>
    where
        F: FnMut(CompressionSetting) -> Result<Vec<u8>, CompressError>,
    {
        let window = state.window();

        for &max_dimension in self.dimension_presets {
            // Half-open range of ladder indexes still in play
            let mut lo = 0;
            let mut hi = self.quality_ladder.len();

            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                let setting = CompressionSetting::new(self.quality_ladder[mid], max_dimension);

                match state.probe(Stage::Search, setting, &mut probe) {
                    ProbeStep::Fit(fit) => return Some(fit),
                    // A failed probe says nothing about direction; move to the next preset
                    ProbeStep::Failed => break,
                    ProbeStep::Miss(size) if size > window.max => hi = mid,
                    ProbeStep::Miss(_) => lo = mid + 1,
                }
            }
        }

        None
    }
}

/// Fixed, strictly decreasing presets tried once each.
#[derive(Debug, Clone, Copy)]
pub struct FallbackLadder<'a> {
    pub presets: &'a [CompressionSetting],
}

impl<'a> FallbackLadder<'a> {
    pub fn new(presets: &'a [CompressionSetting]) -> Self {
        Self { presets }
    }

    pub fn run<F>(&self, state: &mut SearchState, mut probe: F) -> Option<Candidate>
    where
        F: FnMut(CompressionSetting) -> Result<Vec<u8>, CompressError>,
    {
        for &setting in self.presets {
            if let ProbeStep::Fit(fit) = state.probe(Stage::Fallback, setting, &mut probe) {
                return Some(fit);
            }
        }
        None
    }
}
