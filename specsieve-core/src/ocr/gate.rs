//! OCR gate
//!
//! For every picture or graphics region on a page:
//! 1. If the region overlaps any text span, it already carries selectable
//!    text and is skipped outright (no attempt, no record).
//! 2. Otherwise an `ocr` citation id is reserved, in discovery order, before
//!    any work is dispatched.
//! 3. Reserved regions are rendered and recognized in parallel; each render
//!    runs on the shared render pool, which bounds live bitmaps.
//! 4. A result is kept only when the mean token confidence clears the
//!    threshold. Engine and render failures count as "no result".
//!
//! Kept results are attached to the nearest caption-bearing text block.

use super::{aggregate_confidence, join_tokens, OcrEngine};
use crate::citation::{CitationAllocator, CitationKind};
use crate::concurrency::RenderPool;
use crate::error::OcrError;
use crate::geometry;
use crate::readers::StructureReader;
use crate::types::*;
use anyhow::{anyhow, Result};
use rayon::prelude::*;
use regex::Regex;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct OcrGateSettings {
    pub dpi: u32,
    pub threshold: f32,
    pub language: String,
}

impl Default for OcrGateSettings {
    fn default() -> Self {
        Self {
            dpi: 300,
            threshold: 0.7,
            language: "eng".to_string(),
        }
    }
}

/// A visual region eligible for OCR
#[derive(Debug, Clone)]
pub struct OcrCandidate {
    pub region_citation_id: String,
    pub bbox: BoundingBox,
}

/// Decides whether a text block is a figure/table caption
pub struct CaptionMatcher {
    patterns: Vec<Regex>,
}

impl CaptionMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| anyhow!("invalid caption pattern {:?}: {}", p, e)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_caption(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }

    /// Nearest caption-bearing text block by center distance.
    /// Ties go to the block discovered first.
    pub fn nearest_caption(&self, bbox: &BoundingBox, blocks: &[Block]) -> Option<String> {
        let mut best: Option<(f32, &Block)> = None;
        for block in blocks {
            let BlockPayload::Text { content, .. } = &block.payload else {
                continue;
            };
            if !self.is_caption(content) {
                continue;
            }
            let distance = geometry::center_distance(bbox, &block.bbox);
            match best {
                Some((d, _)) if d <= distance => {}
                _ => best = Some((distance, block)),
            }
        }
        best.map(|(_, block)| block.citation_id.clone())
    }
}

/// What happened to one dispatched region
#[derive(Debug)]
enum RegionOutcome {
    Recognized { text: String, confidence: f32 },
    BelowThreshold(f32),
    Nothing,
    Failed(OcrError),
}

#[derive(Debug, Default)]
pub struct GateOutcome {
    pub results: Vec<OcrResult>,
    pub stats: OcrGateStats,
}

pub struct OcrGate<'a> {
    reader: &'a dyn StructureReader,
    engine: &'a dyn OcrEngine,
    renders: &'a RenderPool,
    settings: &'a OcrGateSettings,
}

impl<'a> OcrGate<'a> {
    pub fn new(
        reader: &'a dyn StructureReader,
        engine: &'a dyn OcrEngine,
        renders: &'a RenderPool,
        settings: &'a OcrGateSettings,
    ) -> Self {
        Self {
            reader,
            engine,
            renders,
            settings,
        }
    }

    /// True when the region overlaps none of the page's text spans
    pub fn needs_ocr(region: &BoundingBox, span_boxes: &[BoundingBox]) -> bool {
        !span_boxes.iter().any(|span| geometry::overlaps(region, span))
    }

    pub fn run(
        &self,
        page: u32,
        candidates: &[OcrCandidate],
        span_boxes: &[BoundingBox],
        text_blocks: &[Block],
        captions: &CaptionMatcher,
        allocator: &mut CitationAllocator,
    ) -> GateOutcome {
        let mut stats = OcrGateStats {
            candidates: candidates.len(),
            ..Default::default()
        };

        // Ids are fixed here, before dispatch, so completion order never matters
        let mut reserved: Vec<(String, &OcrCandidate)> = Vec::new();
        for candidate in candidates {
            if !Self::needs_ocr(&candidate.bbox, span_boxes) {
                debug!(
                    page,
                    region = %candidate.region_citation_id,
                    "Region overlaps text spans, skipping OCR"
                );
                stats.skipped_text_overlap += 1;
                continue;
            }
            reserved.push((allocator.next_citation_id(CitationKind::Ocr), candidate));
        }

        let outcomes: Vec<RegionOutcome> = reserved
            .par_iter()
            .map(|(_, candidate)| self.recognize_region(page, candidate))
            .collect();

        let mut results = Vec::new();
        for ((citation_id, candidate), outcome) in reserved.iter().zip(outcomes) {
            match outcome {
                RegionOutcome::Recognized { text, confidence } => {
                    stats.stored += 1;
                    results.push(OcrResult {
                        bbox: candidate.bbox,
                        text,
                        confidence,
                        confidence_level: ConfidenceLevel::from_score(confidence),
                        engine: self.engine.name().to_string(),
                        citation_id: citation_id.clone(),
                        region_citation_id: candidate.region_citation_id.clone(),
                        associated_block_citation_id: captions
                            .nearest_caption(&candidate.bbox, text_blocks),
                        language: self.settings.language.clone(),
                    });
                }
                RegionOutcome::BelowThreshold(confidence) => {
                    debug!(
                        page,
                        region = %candidate.region_citation_id,
                        confidence,
                        "OCR below threshold, discarded"
                    );
                    stats.below_threshold += 1;
                }
                RegionOutcome::Nothing => {
                    stats.below_threshold += 1;
                }
                RegionOutcome::Failed(e) => {
                    warn!(
                        page,
                        region = %candidate.region_citation_id,
                        error = %e,
                        "OCR failed for region, treating as no result"
                    );
                    stats.engine_errors += 1;
                }
            }
        }

        GateOutcome { results, stats }
    }

    fn recognize_region(&self, page: u32, candidate: &OcrCandidate) -> RegionOutcome {
        let recognized = self.renders.run(|| {
            let bitmap = self
                .reader
                .render_region(page, &candidate.bbox, self.settings.dpi)?;
            self.engine.recognize(&bitmap, &self.settings.language)
        });
        let tokens = match recognized {
            Ok(tokens) => tokens,
            Err(e) => return RegionOutcome::Failed(e),
        };

        match aggregate_confidence(&tokens) {
            None => RegionOutcome::Nothing,
            Some(confidence) if confidence >= self.settings.threshold => {
                let text = join_tokens(&tokens);
                if text.is_empty() {
                    RegionOutcome::Nothing
                } else {
                    RegionOutcome::Recognized { text, confidence }
                }
            }
            Some(confidence) => RegionOutcome::BelowThreshold(confidence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::OcrToken;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BlankReader;

    impl StructureReader for BlankReader {
        fn page_count(&self) -> u32 {
            1
        }
        fn read_page(&self, _page: u32) -> Result<RawPage> {
            Err(anyhow!("not used"))
        }
        fn render_region(&self, _page: u32, bbox: &BoundingBox, dpi: u32) -> Result<Bitmap, OcrError> {
            // Encode the region's x0 so the engine can pick a confidence
            Ok(Bitmap {
                png: vec![bbox.x0 as u8],
                dpi,
            })
        }
        fn name(&self) -> &str {
            "blank"
        }
    }

    /// Confidence keyed by region x0: 0 => 0.95, 1 => 0.4, 2 => error
    struct ScriptedEngine {
        calls: AtomicUsize,
    }

    impl OcrEngine for ScriptedEngine {
        fn recognize(&self, bitmap: &Bitmap, _language: &str) -> Result<Vec<OcrToken>, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match bitmap.png[0] {
                0 => Ok(vec![OcrToken::new("Pin", 0.95), OcrToken::new("map", 0.95)]),
                1 => Ok(vec![OcrToken::new("noise", 0.4)]),
                _ => Err(OcrError::RecognitionFailed("boom".into())),
            }
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn text_block(id: &str, bbox: BoundingBox, content: &str) -> Block {
        Block {
            bbox,
            citation_id: id.to_string(),
            payload: BlockPayload::Text {
                markdown_slice: content.to_string(),
                content: content.to_string(),
            },
        }
    }

    fn candidate(id: &str, x0: f32, y0: f32) -> OcrCandidate {
        OcrCandidate {
            region_citation_id: id.to_string(),
            bbox: BoundingBox::new(x0, y0, x0 + 0.5, y0 + 50.0),
        }
    }

    #[test]
    fn overlapping_regions_are_never_attempted() {
        let reader = BlankReader;
        let engine = ScriptedEngine {
            calls: AtomicUsize::new(0),
        };
        let renders = RenderPool::new(2).unwrap();
        let settings = OcrGateSettings::default();
        let gate = OcrGate::new(&reader, &engine, &renders, &settings);
        let captions = CaptionMatcher::new(&[]).unwrap();
        let mut alloc = CitationAllocator::new(1);

        let region = candidate("p1_img1", 0.0, 100.0);
        let spans = vec![region.bbox];
        let outcome = gate.run(1, &[region], &spans, &[], &captions, &mut alloc);

        assert!(outcome.results.is_empty());
        assert_eq!(outcome.stats.skipped_text_overlap, 1);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert_eq!(alloc.issued(CitationKind::Ocr), 0);
    }

    #[test]
    fn threshold_errors_and_reservation_order() {
        let reader = BlankReader;
        let engine = ScriptedEngine {
            calls: AtomicUsize::new(0),
        };
        let renders = RenderPool::new(2).unwrap();
        let settings = OcrGateSettings::default();
        let gate = OcrGate::new(&reader, &engine, &renders, &settings);
        let captions = CaptionMatcher::new(&[r"(?i)\bfig(?:ure)?\.?\s*\d+".to_string()]).unwrap();
        let mut alloc = CitationAllocator::new(1);

        let blocks = vec![
            text_block("p1_txt1", BoundingBox::new(0.0, 0.0, 100.0, 10.0), "Intro text"),
            text_block("p1_txt2", BoundingBox::new(0.0, 160.0, 100.0, 170.0), "Figure 2 pins"),
            text_block("p1_txt3", BoundingBox::new(0.0, 400.0, 100.0, 410.0), "Fig. 3 later"),
        ];
        let candidates = vec![
            candidate("p1_gfx1", 1.0, 100.0), // below threshold
            candidate("p1_img1", 0.0, 100.0), // stored
            candidate("p1_gfx2", 2.0, 100.0), // engine error
        ];
        let outcome = gate.run(1, &candidates, &[], &blocks, &captions, &mut alloc);

        assert_eq!(outcome.results.len(), 1);
        let result = &outcome.results[0];
        // Second reservation, regardless of which region finished first
        assert_eq!(result.citation_id, "p1_ocr2");
        assert_eq!(result.region_citation_id, "p1_img1");
        assert_eq!(result.text, "Pin map");
        assert_eq!(result.associated_block_citation_id.as_deref(), Some("p1_txt2"));
        assert_eq!(outcome.stats.below_threshold, 1);
        assert_eq!(outcome.stats.engine_errors, 1);
        assert_eq!(alloc.issued(CitationKind::Ocr), 3);
    }

    #[test]
    fn caption_ties_go_to_first_block() {
        let captions = CaptionMatcher::new(&[r"(?i)table\s+\d+".to_string()]).unwrap();
        let region = BoundingBox::new(0.0, 50.0, 10.0, 60.0);
        let blocks = vec![
            text_block("p1_txt1", BoundingBox::new(0.0, 30.0, 10.0, 40.0), "Table 1"),
            text_block("p1_txt2", BoundingBox::new(0.0, 70.0, 10.0, 80.0), "Table 2"),
        ];
        assert_eq!(
            captions.nearest_caption(&region, &blocks).as_deref(),
            Some("p1_txt1")
        );
    }
}
